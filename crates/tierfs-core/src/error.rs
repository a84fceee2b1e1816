use thiserror::Error;

/// Canonical error type for tiering operations.
#[derive(Debug, Error)]
pub enum TierError {
    /// An argument violated a precondition. Programmer error, never retried.
    #[error("invalid argument: {message}")]
    Invalid {
        /// Human-readable description of the violated precondition.
        message: String,
    },

    /// A non-blocking queue operation found the queue full (push) or empty
    /// (pop). Normal control-flow signal, not a failure.
    #[error("operation would block")]
    WouldBlock,

    /// A file-level system call failed.
    #[error("{syscall} failed: {source}")]
    FileOp {
        /// Name of the failing system call (`open`, `fsetxattr`, ...).
        syscall: &'static str,
        /// Original OS error.
        #[source]
        source: std::io::Error,
    },

    /// The remote store rejected an operation with a non-retryable status.
    #[error("object store error: {message}")]
    ObjectStore {
        /// Adapter-specific status description.
        message: String,
    },

    /// The requested object does not exist in the remote store.
    #[error("object `{object_id}` not found in remote store")]
    ObjectNotFound {
        /// Key that was looked up.
        object_id: String,
    },

    /// Out of memory, descriptors, or shared-memory space. Fatal for the
    /// affected operation, non-fatal for the daemon.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// What ran out.
        message: String,
    },

    /// The configuration file is malformed or inconsistent. Fatal at startup.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Human-readable description of the problem.
        message: String,
    },

    /// Unexpected internal condition, e.g. a worker that died or wedged.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },
}

impl TierError {
    /// Creates an `Invalid` variant.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Creates a `FileOp` variant from the current OS error.
    #[must_use]
    pub fn file_op(syscall: &'static str, source: std::io::Error) -> Self {
        Self::FileOp { syscall, source }
    }

    /// Creates a `FileOp` variant capturing `errno`.
    #[must_use]
    pub fn last_os_error(syscall: &'static str) -> Self {
        Self::FileOp {
            syscall,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Creates an `ObjectStore` variant.
    #[must_use]
    pub fn object_store(message: impl Into<String>) -> Self {
        Self::ObjectStore {
            message: message.into(),
        }
    }

    /// Creates a `ResourceExhausted` variant.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a `ConfigInvalid` variant.
    #[must_use]
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the `WouldBlock` control-flow signal.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Convenient result alias for tiering operations.
pub type TierResult<T> = Result<T, TierError>;
