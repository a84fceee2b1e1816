//! S3 implementation of [`ObjectStore`].
//!
//! Works against AWS S3 and S3-compatible endpoints (MinIO, Ceph RGW).
//! Addressing is path-style; credentials and endpoint come from the daemon
//! configuration. Every network operation is retried up to the configured
//! bound while the failure class stays retryable.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::BucketCannedAcl;
use aws_sdk_s3::{Client, Config as S3Config};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use tierfs_core::{Config, TierError, TierResult};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Maximum S3 object key length in bytes.
const MAX_KEY_LEN: usize = 1024;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

/// S3-backed remote tier.
pub struct S3Store {
    client: Client,
    bucket: String,
    retries: u32,
}

impl S3Store {
    /// Builds the store from the daemon configuration. Validates the bucket
    /// name syntactically; remote reachability is checked by
    /// [`ObjectStore::connect`].
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the bucket name or endpoint is malformed.
    pub fn from_config(config: &Config) -> TierResult<Self> {
        validate_bucket_name(&config.s3_bucket)?;
        if config.s3_endpoint.is_empty() {
            return Err(TierError::config_invalid("Hostname is required for s3"));
        }

        let endpoint = format!(
            "{}://{}",
            config.transfer_protocol.scheme(),
            config.s3_endpoint
        );
        let credentials = Credentials::new(
            config.s3_access_key.clone(),
            config.s3_secret_key.clone(),
            None,
            None,
            "tierfs-static",
        );
        let s3_config = S3Config::builder()
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .force_path_style(true)
            .behavior_version(BehaviorVersion::latest())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.s3_bucket.clone(),
            retries: config.s3_retries,
        })
    }

    /// Duplicates the migration descriptor and wraps it for async I/O, so
    /// the SDK stream owns its own descriptor and the caller's stays valid.
    fn dup_for_transfer(file: &File) -> TierResult<tokio::fs::File> {
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        if fd < 0 {
            return Err(TierError::last_os_error("dup"));
        }
        let owned = unsafe { File::from_raw_fd(fd) };
        Ok(tokio::fs::File::from_std(owned))
    }

    async fn backoff(&self, attempt: u32) {
        let millis = INITIAL_BACKOFF_MS
            .saturating_mul(1u64 << attempt.min(16))
            .min(MAX_BACKOFF_MS);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl super::ObjectStore for S3Store {
    async fn connect(&self) -> TierResult<()> {
        let mut attempt = 0;
        let missing = loop {
            match self.client.head_bucket().bucket(&self.bucket).send().await {
                Ok(_) => break false,
                Err(err) => match classify(&err) {
                    ErrorClass::NotFound => break true,
                    ErrorClass::Retryable if attempt < self.retries => {
                        attempt += 1;
                        debug!(bucket = %self.bucket, attempt, "retrying bucket probe");
                        self.backoff(attempt).await;
                    }
                    _ => return Err(op_error("head_bucket", &err)),
                },
            }
        };

        if missing {
            let mut attempt = 0;
            loop {
                match self
                    .client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .acl(BucketCannedAcl::Private)
                    .send()
                    .await
                {
                    Ok(_) => {
                        info!(bucket = %self.bucket, "created remote bucket");
                        break;
                    }
                    Err(err) => {
                        // Another daemon may have won the creation race.
                        if err
                            .as_service_error()
                            .and_then(ProvideErrorMetadata::code)
                            .is_some_and(|code| code == "BucketAlreadyOwnedByYou")
                        {
                            break;
                        }
                        match classify(&err) {
                            ErrorClass::Retryable if attempt < self.retries => {
                                attempt += 1;
                                self.backoff(attempt).await;
                            }
                            _ => return Err(op_error("create_bucket", &err)),
                        }
                    }
                }
            }
        }

        info!(bucket = %self.bucket, "remote store ready");
        Ok(())
    }

    async fn disconnect(&self) {
        debug!(bucket = %self.bucket, "disconnected from remote store");
    }

    async fn upload(&self, file: &File, object_id: &str) -> TierResult<()> {
        let mut attempt = 0;
        loop {
            // The stream consumes its descriptor, so each attempt gets a
            // fresh duplicate rewound to the start.
            let mut local = Self::dup_for_transfer(file)?;
            local
                .seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|err| TierError::file_op("lseek", err))?;
            let body = ByteStream::read_from()
                .file(local)
                .build()
                .await
                .map_err(|err| {
                    TierError::object_store(format!("cannot stream file for upload: {err}"))
                })?;

            match self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(object_id)
                .body(body)
                .send()
                .await
            {
                Ok(_) => {
                    debug!(object_id, "object uploaded");
                    return Ok(());
                }
                Err(err) => match classify(&err) {
                    ErrorClass::Retryable if attempt < self.retries => {
                        attempt += 1;
                        warn!(object_id, attempt, "retrying upload");
                        self.backoff(attempt).await;
                    }
                    _ => return Err(op_error("put_object", &err)),
                },
            }
        }
    }

    async fn download(&self, file: &File, object_id: &str) -> TierResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(object_id)
                .send()
                .await
            {
                Ok(resp) => {
                    let mut local = Self::dup_for_transfer(file)?;
                    local
                        .seek(std::io::SeekFrom::Start(0))
                        .await
                        .map_err(|err| TierError::file_op("lseek", err))?;
                    let mut body = resp.body.into_async_read();
                    let written = tokio::io::copy(&mut body, &mut local)
                        .await
                        .map_err(|err| TierError::file_op("write", err))?;
                    local
                        .flush()
                        .await
                        .map_err(|err| TierError::file_op("write", err))?;
                    local
                        .set_len(written)
                        .await
                        .map_err(|err| TierError::file_op("ftruncate", err))?;
                    debug!(object_id, bytes = written, "object downloaded");
                    return Ok(());
                }
                Err(err) => match classify(&err) {
                    ErrorClass::NotFound => {
                        return Err(TierError::ObjectNotFound {
                            object_id: object_id.to_string(),
                        });
                    }
                    ErrorClass::Retryable if attempt < self.retries => {
                        attempt += 1;
                        warn!(object_id, attempt, "retrying download");
                        self.backoff(attempt).await;
                    }
                    ErrorClass::Fatal | ErrorClass::Retryable => {
                        return Err(op_error("get_object", &err));
                    }
                },
            }
        }
    }

    fn object_id_for(&self, path: &Path) -> String {
        super::reversed_object_id(path, MAX_KEY_LEN)
    }

    fn object_id_max_len(&self) -> usize {
        MAX_KEY_LEN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Retryable,
    NotFound,
    Fatal,
}

fn classify<E>(err: &SdkError<E, HttpResponse>) -> ErrorClass
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            ErrorClass::Retryable
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or("");
            if status == 404 || matches!(code, "NoSuchKey" | "NoSuchBucket" | "NotFound") {
                ErrorClass::NotFound
            } else if status >= 500
                || status == 429
                || matches!(
                    code,
                    "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"
                )
            {
                ErrorClass::Retryable
            } else {
                ErrorClass::Fatal
            }
        }
        _ => ErrorClass::Fatal,
    }
}

fn op_error<E>(op: &str, err: &SdkError<E, HttpResponse>) -> TierError
where
    E: ProvideErrorMetadata,
{
    let detail = match err.as_service_error() {
        Some(svc) => format!(
            "{} ({})",
            svc.message().unwrap_or("service error"),
            svc.code().unwrap_or("unknown")
        ),
        None => err.to_string(),
    };
    TierError::object_store(format!("{op} failed: {detail}"))
}

/// Syntactic bucket-name check for path-style addressing: 3-63 characters,
/// lowercase letters, digits, dots and hyphens, starting and ending
/// alphanumeric, no consecutive dots.
fn validate_bucket_name(name: &str) -> TierResult<()> {
    let bytes = name.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return Err(TierError::config_invalid(format!(
            "bucket name `{name}` must be 3-63 characters"
        )));
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(TierError::config_invalid(format!(
            "bucket name `{name}` must start and end with a lowercase letter or digit"
        )));
    }
    if !bytes.iter().all(|b| alnum(*b) || *b == b'.' || *b == b'-') {
        return Err(TierError::config_invalid(format!(
            "bucket name `{name}` contains invalid characters"
        )));
    }
    if name.contains("..") {
        return Err(TierError::config_invalid(format!(
            "bucket name `{name}` must not contain consecutive dots"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierfs_core::TransferProtocol;

    fn s3_config() -> Config {
        let mut config = Config::default();
        config.remote_protocol = "s3".to_string();
        config.transfer_protocol = TransferProtocol::Https;
        config.s3_endpoint = "s3.example.com".to_string();
        config.s3_bucket = "tierfs-bucket".to_string();
        config.s3_access_key = "ak".to_string();
        config.s3_secret_key = "sk".to_string();
        config.s3_retries = 3;
        config
    }

    #[test]
    fn builds_from_config() {
        let store = S3Store::from_config(&s3_config()).unwrap();
        assert_eq!(store.bucket, "tierfs-bucket");
        assert_eq!(store.retries, 3);
    }

    #[test]
    fn rejects_empty_endpoint() {
        let mut config = s3_config();
        config.s3_endpoint.clear();
        assert!(S3Store::from_config(&config).is_err());
    }

    #[test]
    fn bucket_names_are_validated() {
        assert!(validate_bucket_name("tierfs-bucket").is_ok());
        assert!(validate_bucket_name("s3.bucket").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("UpperCase").is_err());
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
        assert!(validate_bucket_name("dot..dot").is_err());
        assert!(validate_bucket_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn object_ids_respect_the_s3_bound() {
        use super::super::ObjectStore;

        let store = S3Store::from_config(&s3_config()).unwrap();
        let long = std::path::PathBuf::from(format!("/{}", "d/".repeat(2000)));
        assert!(store.object_id_for(&long).len() <= store.object_id_max_len());
    }
}
