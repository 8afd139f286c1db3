//! Error types for the geos library

use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for geos operations
pub type Result<T> = std::result::Result<T, GeosError>;

/// Main error type for geos operations
#[derive(Error, Debug)]
pub enum GeosError {
    /// Lookup miss or absent id
    #[error("not found")]
    NotFound,

    /// Layer or database not loaded
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Query arrived before the index finished loading
    #[error("not ready")]
    NotReady,

    /// Source configured with an empty location
    #[error("disabled: {0}")]
    Disabled(String),

    /// Unexpected file inside a patch bundle
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    /// Another updater holds the `.tmp` file
    #[error("update already in progress: {}", .0.display())]
    UpdateInProgress(PathBuf),

    /// Corrupt data, depth overflow or overflow-on-assignment
    #[error("decode error: {0}")]
    Decode(String),

    /// HTTP failure or unexpected status
    #[error("transport error: {0}")]
    Transport(String),

    /// Database structure is unusable (e.g. metadata marker missing)
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// Malformed CIDR, prefix length or IP
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// Operation aborted through its cancel token
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl GeosError {
    /// True for a plain lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, GeosError::NotFound)
    }
}

impl serde::de::Error for GeosError {
    fn custom<T: Display>(msg: T) -> Self {
        GeosError::Decode(msg.to_string())
    }
}

impl From<ipnet::AddrParseError> for GeosError {
    fn from(err: ipnet::AddrParseError) -> Self {
        GeosError::InvalidNetwork(err.to_string())
    }
}

impl From<ipnet::PrefixLenError> for GeosError {
    fn from(err: ipnet::PrefixLenError) -> Self {
        GeosError::InvalidNetwork(err.to_string())
    }
}

impl From<ureq::Error> for GeosError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                GeosError::Transport(format!("HTTP {} from {}", code, response.get_url()))
            }
            ureq::Error::Transport(t) => GeosError::Transport(t.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for GeosError {
    fn from(err: zip::result::ZipError) -> Self {
        GeosError::Corrupt(format!("zip archive: {}", err))
    }
}
