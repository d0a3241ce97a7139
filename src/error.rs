use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LookoutError {
    #[error("provider credentials missing: {0}")]
    MissingCredentials(&'static str),
    #[error("unknown record list: {0}")]
    UnknownList(String),
    #[error("snapshot path rejected: {0}")]
    SnapshotPathRejected(String),
    #[error("capture unavailable for camera source {0}")]
    CaptureUnavailable(String),
    #[error("question must not be empty")]
    EmptyQuestion,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record rejected for list {list}: {reason}")]
    Rejected { list: &'static str, reason: String },
    #[error("legacy list lock failed: {0:#}")]
    Lock(anyhow::Error),
}

/// Why the frame inspector vetoed a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("file_missing")]
    FileMissing,
    #[error("file_too_large")]
    FileTooLarge,
    #[error("unsupported_format")]
    UnsupportedFormat,
    #[error("image_too_small")]
    ImageTooSmall,
    #[error("image_too_large")]
    ImageTooLarge,
    #[error("decode_error")]
    DecodeError,
}

impl ValidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileMissing => "file_missing",
            Self::FileTooLarge => "file_too_large",
            Self::UnsupportedFormat => "unsupported_format",
            Self::ImageTooSmall => "image_too_small",
            Self::ImageTooLarge => "image_too_large",
            Self::DecodeError => "decode_error",
        }
    }
}
