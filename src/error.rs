//! The server's error taxonomy.
//!
//! One closed enum instead of a boxed `dyn Error` so call sites that need to
//! react to *which* kind of failure occurred (e.g. picking an HTTP status
//! code) can match on it instead of downcasting.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Posix {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to canonicalise path: {0}")]
    Canonicalisation(String),

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn posix(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Posix {
            context: context.into(),
            source,
        }
    }

    /// The HTTP status code a connection-level caller should respond with
    /// for this kind of failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotAllowed(_) => 400,
            Error::Canonicalisation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Posix { .. } | Error::Compression(_) | Error::Other(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Posix {
            context: "I/O error".to_string(),
            source,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
