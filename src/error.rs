//! Error types for deskflow.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Event bus error: {0}")]
    Bus(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Store, bus and IO failures. Request paths surface these to the caller;
    /// background paths log them and drop the unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Bus(_) | Error::Io(_))
    }

    /// Status code the HTTP boundary should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) | Error::InvalidTransition { .. } => 409,
            Error::Validation(_) | Error::Json(_) => 422,
            Error::Store(_) | Error::Bus(_) | Error::Io(_) => 503,
            Error::Config(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}
