//! Daemon configuration.
//!
//! The configuration file is a sectioned key-value dialect: `<Section>` /
//! `</Section>` tags group options, `#` starts a comment, and every other
//! non-empty line is `Key value`. The three sections are `General`,
//! `Internal` and `S3RemoteStore`; the key set is globally unique, so the
//! tags are structural only. Unknown keys are errors and duplicate keys are
//! last-wins.

use crate::error::{TierError, TierResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire protocol used by the remote-store adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferProtocol {
    /// Plain HTTP.
    Http,
    /// TLS.
    Https,
}

impl TransferProtocol {
    fn parse(value: &str) -> TierResult<Self> {
        match value {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(TierError::config_invalid(format!(
                "TransferProtocol must be `http` or `https`, got `{other}`"
            ))),
        }
    }

    /// URL scheme string for this protocol.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Daemon configuration, read once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root of the scan. The scanner never crosses out of this mount.
    pub fs_mount_point: PathBuf,

    /// Minimum seconds between two successive filesystem scans.
    pub scan_interval_sec: u64,

    /// Local-tier occupancy at which eviction activates.
    pub demote_start_rate: f64,

    /// Local-tier occupancy at which eviction deactivates.
    pub demote_stop_rate: f64,

    /// Capacity of the primary demotion queue.
    pub primary_demote_qsize: usize,

    /// Capacity of the secondary demotion queue.
    pub secondary_demote_qsize: usize,

    /// Capacity of the primary (shared-memory) promotion queue.
    pub primary_promote_qsize: usize,

    /// Capacity of the secondary promotion queue.
    pub secondary_promote_qsize: usize,

    /// Upper bound on any stored path, terminator included. Doubles as the
    /// queue record size.
    pub path_max: usize,

    /// Remote-store protocol tag; resolved against the adapter registry.
    pub remote_protocol: String,

    /// Wire protocol for the adapter.
    pub transfer_protocol: TransferProtocol,

    /// Remote store hostname (endpoint without scheme).
    pub s3_endpoint: String,

    /// Bucket used as the remote tier.
    pub s3_bucket: String,

    /// Access key id.
    pub s3_access_key: String,

    /// Secret access key.
    #[serde(skip_serializing)]
    pub s3_secret_key: String,

    /// Maximum retries for retryable remote statuses.
    pub s3_retries: u32,

    /// Minimum `atime` age in seconds before a file becomes a demotion
    /// candidate.
    pub eviction_age_sec: u64,

    /// Bound on consecutive whole-scan failures before the scanner gives up;
    /// `-1` disables the bound.
    pub scan_max_fails: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fs_mount_point: PathBuf::new(),
            scan_interval_sec: 60,
            demote_start_rate: 0.8,
            demote_stop_rate: 0.7,
            primary_demote_qsize: 256,
            secondary_demote_qsize: 256,
            primary_promote_qsize: 256,
            secondary_promote_qsize: 256,
            path_max: 4096,
            remote_protocol: String::new(),
            transfer_protocol: TransferProtocol::Https,
            s3_endpoint: String::new(),
            s3_bucket: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_retries: 3,
            eviction_age_sec: 30,
            scan_max_fails: -1,
        }
    }
}

const SECTIONS: &[&str] = &["General", "Internal", "S3RemoteStore"];

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file cannot be read, contains unknown
    /// keys or malformed values, or fails [`Config::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> TierResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            TierError::config_invalid(format!("cannot read `{}`: {err}", path.display()))
        })?;
        Self::from_str(&text)
    }

    /// Parses configuration text and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` on any syntax or validation failure.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> TierResult<Self> {
        let mut config = Self::default();
        let mut section: Option<&'static str> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(tag) = line.strip_prefix('<') {
                section = parse_section_tag(tag, section, lineno + 1)?;
                continue;
            }

            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .ok_or_else(|| {
                    TierError::config_invalid(format!("line {}: key `{line}` has no value", lineno + 1))
                })?;
            if value.is_empty() {
                return Err(TierError::config_invalid(format!(
                    "line {}: key `{key}` has no value",
                    lineno + 1
                )));
            }

            config.apply(key, value)?;
        }

        if let Some(open) = section {
            return Err(TierError::config_invalid(format!(
                "section `{open}` is not closed"
            )));
        }

        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> TierResult<()> {
        match key {
            "FsMountPoint" => self.fs_mount_point = PathBuf::from(value),
            "PathMax" => self.path_max = parse_number(key, value)?,
            "RemoteStoreProtocol" => self.remote_protocol = value.to_string(),
            "ScanfsIterTimeoutSec" => self.scan_interval_sec = parse_number(key, value)?,
            "MoveOutStartRate" => self.demote_start_rate = parse_number(key, value)?,
            "MoveOutStopRate" => self.demote_stop_rate = parse_number(key, value)?,
            "PrimaryDownloadQueueMaxSize" => self.primary_promote_qsize = parse_number(key, value)?,
            "SecondaryDownloadQueueMaxSize" => {
                self.secondary_promote_qsize = parse_number(key, value)?;
            }
            "PrimaryUploadQueueMaxSize" => self.primary_demote_qsize = parse_number(key, value)?,
            "SecondaryUploadQueueMaxSize" => {
                self.secondary_demote_qsize = parse_number(key, value)?;
            }
            "EvictionAgeSec" => self.eviction_age_sec = parse_number(key, value)?,
            "ScanfsMaxFails" => self.scan_max_fails = parse_number(key, value)?,
            "Hostname" => self.s3_endpoint = value.to_string(),
            "Bucket" => self.s3_bucket = value.to_string(),
            "AccessKeyId" => self.s3_access_key = value.to_string(),
            "SecretAccessKey" => self.s3_secret_key = value.to_string(),
            "TransferProtocol" => self.transfer_protocol = TransferProtocol::parse(value)?,
            "OperationRetries" => self.s3_retries = parse_number(key, value)?,
            other => {
                return Err(TierError::config_invalid(format!("unknown key `{other}`")));
            }
        }
        Ok(())
    }

    /// Validates field-level constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` naming the first violated constraint.
    pub fn validate(&self) -> TierResult<()> {
        if self.fs_mount_point.as_os_str().is_empty() {
            return Err(TierError::config_invalid("FsMountPoint is required"));
        }
        if !self.fs_mount_point.is_absolute() {
            return Err(TierError::config_invalid("FsMountPoint must be absolute"));
        }
        if self.remote_protocol.is_empty() {
            return Err(TierError::config_invalid("RemoteStoreProtocol is required"));
        }
        if !(self.demote_start_rate > 0.0 && self.demote_start_rate < 1.0) {
            return Err(TierError::config_invalid(
                "MoveOutStartRate must be in (0, 1)",
            ));
        }
        if !(self.demote_stop_rate > 0.0 && self.demote_stop_rate < 1.0) {
            return Err(TierError::config_invalid(
                "MoveOutStopRate must be in (0, 1)",
            ));
        }
        if self.demote_stop_rate > self.demote_start_rate {
            return Err(TierError::config_invalid(
                "MoveOutStopRate must not exceed MoveOutStartRate",
            ));
        }
        for (name, size) in [
            ("PrimaryDownloadQueueMaxSize", self.primary_promote_qsize),
            ("SecondaryDownloadQueueMaxSize", self.secondary_promote_qsize),
            ("PrimaryUploadQueueMaxSize", self.primary_demote_qsize),
            ("SecondaryUploadQueueMaxSize", self.secondary_demote_qsize),
        ] {
            if size == 0 {
                return Err(TierError::config_invalid(format!("{name} must be > 0")));
            }
        }
        if self.path_max < 2 {
            return Err(TierError::config_invalid("PathMax must be >= 2"));
        }
        if self.s3_retries == 0 {
            return Err(TierError::config_invalid("OperationRetries must be > 0"));
        }
        Ok(())
    }

    /// Minimum time between scans.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_sec)
    }

    /// Minimum `atime` age for demotion candidates.
    #[must_use]
    pub fn eviction_age(&self) -> Duration {
        Duration::from_secs(self.eviction_age_sec)
    }
}

fn parse_section_tag(
    tag: &str,
    open: Option<&'static str>,
    lineno: usize,
) -> TierResult<Option<&'static str>> {
    let (closing, name) = match tag.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, tag),
    };
    let name = name.strip_suffix('>').ok_or_else(|| {
        TierError::config_invalid(format!("line {lineno}: malformed section tag"))
    })?;
    let known = SECTIONS
        .iter()
        .find(|s| **s == name)
        .copied()
        .ok_or_else(|| {
            TierError::config_invalid(format!("line {lineno}: unknown section `{name}`"))
        })?;

    if closing {
        match open {
            Some(current) if current == known => Ok(None),
            _ => Err(TierError::config_invalid(format!(
                "line {lineno}: `</{known}>` does not match an open section"
            ))),
        }
    } else {
        match open {
            None => Ok(Some(known)),
            Some(current) => Err(TierError::config_invalid(format!(
                "line {lineno}: section `{known}` opened inside `{current}`"
            ))),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> TierResult<T> {
    value.parse().map_err(|_| {
        TierError::config_invalid(format!("key `{key}`: cannot parse value `{value}`"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
<General>
FsMountPoint /foo/bar
RemoteStoreProtocol s3
</General>

<Internal>
ScanfsIterTimeoutSec 100
MoveOutStartRate 0.8
MoveOutStopRate 0.7
PrimaryDownloadQueueMaxSize 1111
SecondaryUploadQueueMaxSize 9999
</Internal>

<S3RemoteStore>
Hostname s3_hostname
Bucket s3.bucket
AccessKeyId test_access_key_id
SecretAccessKey test_secret_key
TransferProtocol https
</S3RemoteStore>
";

    #[test]
    fn parses_sample_config() {
        let config = Config::from_str(SAMPLE).unwrap();

        assert_eq!(config.fs_mount_point, PathBuf::from("/foo/bar"));
        assert_eq!(config.scan_interval_sec, 100);
        assert_eq!(config.demote_start_rate, 0.8);
        assert_eq!(config.demote_stop_rate, 0.7);
        assert_eq!(config.primary_promote_qsize, 1111);
        assert_eq!(config.secondary_demote_qsize, 9999);
        assert_eq!(config.remote_protocol, "s3");
        assert_eq!(config.s3_endpoint, "s3_hostname");
        assert_eq!(config.s3_bucket, "s3.bucket");
        assert_eq!(config.s3_access_key, "test_access_key_id");
        assert_eq!(config.s3_secret_key, "test_secret_key");
        assert_eq!(config.transfer_protocol, TransferProtocol::Https);
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let config = Config::from_str(SAMPLE).unwrap();

        assert_eq!(config.eviction_age_sec, 30);
        assert_eq!(config.scan_max_fails, -1);
        assert_eq!(config.path_max, 4096);
        assert_eq!(config.s3_retries, 3);
        assert_eq!(config.secondary_promote_qsize, 256);
        assert_eq!(config.primary_demote_qsize, 256);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let text = format!("{SAMPLE}\nNoSuchOption 1\n");
        let err = Config::from_str(&text).unwrap_err();
        assert!(matches!(err, TierError::ConfigInvalid { .. }));
        assert!(err.to_string().contains("NoSuchOption"));
    }

    #[test]
    fn duplicate_key_last_wins() {
        let text = format!("{SAMPLE}\nScanfsIterTimeoutSec 7\n");
        let config = Config::from_str(&text).unwrap();
        assert_eq!(config.scan_interval_sec, 7);
    }

    #[test]
    fn keys_parse_without_section_tags() {
        let text = "\
FsMountPoint /mnt/data
RemoteStoreProtocol s3
Bucket b-1
";
        let config = Config::from_str(text).unwrap();
        assert_eq!(config.s3_bucket, "b-1");
    }

    #[test]
    fn unclosed_section_is_an_error() {
        let text = "<General>\nFsMountPoint /a\nRemoteStoreProtocol s3\n";
        assert!(Config::from_str(text).is_err());
    }

    #[test]
    fn mismatched_close_tag_is_an_error() {
        let text = "<General>\n</Internal>\n";
        assert!(Config::from_str(text).is_err());
    }

    #[test]
    fn relative_mount_point_fails_validation() {
        let text = "FsMountPoint foo/bar\nRemoteStoreProtocol s3\n";
        let err = Config::from_str(text).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn watermark_ordering_is_enforced() {
        let text = "\
FsMountPoint /a
RemoteStoreProtocol s3
MoveOutStartRate 0.5
MoveOutStopRate 0.9
";
        assert!(Config::from_str(text).is_err());
    }

    #[test]
    fn transfer_protocol_rejects_unknown_scheme() {
        let text = "FsMountPoint /a\nRemoteStoreProtocol s3\nTransferProtocol ftp\n";
        assert!(Config::from_str(text).is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierfs.conf");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.fs_mount_point, PathBuf::from("/foo/bar"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_file("/no/such/tierfs.conf").unwrap_err();
        assert!(err.to_string().contains("/no/such/tierfs.conf"));
    }
}
