//! Custom error types for the page table inspector
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InspectError {
    /// A physical read could not be served by the memory source.
    #[error("Physical address ({address:#x}, +{length:#x}) is not accessible. Reason: {reason}")]
    AddressInaccessible {
        address: u64,
        length: u64,
        reason: String,
    },

    #[error("Unknown filter '{token}' for architecture {architecture}")]
    UnknownFilterToken { token: String, architecture: String },

    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// No root override was given and the register source lacks the root register.
    #[error("Register {register} is not available for {architecture}")]
    MissingRegister {
        architecture: String,
        register: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV into_inner error: {0}")]
    CsvIntoInner(#[from] csv::IntoInnerError<csv::Writer<Vec<u8>>>),

    #[error("UTF-8 conversion error: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),
}

impl InspectError {
    pub fn inaccessible(address: u64, length: u64, reason: impl Into<String>) -> Self {
        InspectError::AddressInaccessible {
            address,
            length,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        InspectError::InvalidArgument(msg.into())
    }
}

pub type InspectResult<T> = Result<T, InspectError>;
