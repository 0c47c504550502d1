//! Crate-wide error type.
//!
//! The variants map onto how failures surface at the HTTP boundary:
//! `NotFound` becomes 404, `Validation` becomes 400, and everything
//! else is a 500 whose detail stays in the server logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A path, manifest, or version is absent.
    #[error("{0} does not exist")]
    NotFound(String),

    /// Malformed payload, manifest, or argument.
    #[error("{0}")]
    Validation(String),

    /// The remote backend answered with an unexpected status.
    #[error("backend request failed: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
