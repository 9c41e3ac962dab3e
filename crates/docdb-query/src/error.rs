use bson::{Document, doc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    TypeMismatch,
    IllegalOperation,
    AlreadyInitialized,
    ExceededTimeLimit,
    UnrecognizedCommand,
    InvalidShardKey,
    InvalidOptions,
    InvalidNamespace,
    CommandNotSupported,
    NamespaceNotSharded,
    FeatureNotSupported,
    CollectionUUIDMismatch,
    UnknownBsonField,
    DuplicateKey,
    /// The operation was cancelled while running.
    Interrupted,
    ViewDepthLimitExceeded,
    CommandNotSupportedOnView,
    /// Positional parse error identified by its location number.
    Location(u32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::IllegalOperation => 20,
            ErrorCode::AlreadyInitialized => 23,
            ErrorCode::ExceededTimeLimit => 50,
            ErrorCode::UnrecognizedCommand => 59,
            ErrorCode::InvalidShardKey => 61,
            ErrorCode::InvalidOptions => 72,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::CommandNotSupported => 115,
            ErrorCode::NamespaceNotSharded => 118,
            ErrorCode::FeatureNotSupported => 238,
            ErrorCode::CollectionUUIDMismatch => 361,
            ErrorCode::UnknownBsonField => 40415,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::Interrupted => 11601,
            ErrorCode::ViewDepthLimitExceeded => 165,
            ErrorCode::CommandNotSupportedOnView => 166,
            ErrorCode::Location(n) => n as i32,
        }
    }

    pub fn name(self) -> String {
        match self {
            ErrorCode::Location(n) => format!("Location{n}"),
            other => format!("{other:?}"),
        }
    }
}

/// Abstract failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Unsupported,
    Semantic,
    Resource,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedToParse, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandNotSupported, message)
    }

    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FeatureNotSupported, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn location(n: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Location(n), message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            ErrorCode::CommandNotSupported
            | ErrorCode::FeatureNotSupported
            | ErrorCode::IllegalOperation => ErrorKind::Unsupported,
            ErrorCode::InvalidShardKey
            | ErrorCode::NamespaceNotSharded
            | ErrorCode::CollectionUUIDMismatch
            | ErrorCode::AlreadyInitialized
            | ErrorCode::DuplicateKey
            | ErrorCode::CommandNotSupportedOnView
            | ErrorCode::InvalidNamespace => ErrorKind::Semantic,
            ErrorCode::ExceededTimeLimit
            | ErrorCode::Interrupted
            | ErrorCode::InternalError
            | ErrorCode::ViewDepthLimitExceeded => ErrorKind::Resource,
            // stage count above limit
            ErrorCode::Location(7749501) => ErrorKind::Resource,
            _ => ErrorKind::Parse,
        }
    }

    /// The `{ok: 0, errmsg, code, codeName}` reply for this error.
    pub fn to_document(&self) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": self.message.clone(),
            "code": self.code.code(),
            "codeName": self.code.name(),
        }
    }
}
