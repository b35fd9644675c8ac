use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FileNotFound,
    ParseError,
    CacheError,
    IoError,
    InvalidRequest,
    VcsError,
    CheckoutFailed,
    TrackerError,
    ResourceExhausted,
    RetryExhausted,
    InsufficientData,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotFound => write!(f, "FILE_NOT_FOUND"),
            Self::ParseError => write!(f, "PARSE_ERROR"),
            Self::CacheError => write!(f, "CACHE_ERROR"),
            Self::IoError => write!(f, "IO_ERROR"),
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::VcsError => write!(f, "VCS_ERROR"),
            Self::CheckoutFailed => write!(f, "CHECKOUT_FAILED"),
            Self::TrackerError => write!(f, "TRACKER_ERROR"),
            Self::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            Self::RetryExhausted => write!(f, "RETRY_EXHAUSTED"),
            Self::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MinerError {
    pub code: ErrorCode,
    pub message: String,
}

impl fmt::Display for MinerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for MinerError {}

impl MinerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::new(ErrorCode::FileNotFound, format!("File not found: {path}"))
    }

    pub fn parse_error(path: &str) -> Self {
        Self::new(ErrorCode::ParseError, format!("Failed to parse: {path}"))
    }

    pub fn vcs(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VcsError, message)
    }
}

/// Extract the error code carried by an `anyhow::Error`, if any.
pub fn code_of(e: &anyhow::Error) -> Option<ErrorCode> {
    e.downcast_ref::<MinerError>().map(|me| me.code)
}
