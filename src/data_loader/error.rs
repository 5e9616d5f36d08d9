// src/data_loader/error.rs
//
//! Error taxonomy for the reader pipeline.
//!
//! Configuration and data errors are recoverable values.  Caller misuse
//! (mixed devices, reading an unregistered archive entry, asking for an
//! unknown stream) is a panic, not a variant here.

use anyhow::Error as AnyError;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ReaderError>;

#[derive(Error, Debug)]
pub enum ReaderError {
    /// Invalid reader or epoch configuration, detected before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// Deserializers disagree with each other, or a sample does not match
    /// its stream description.
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Backend(#[from] AnyError),
}

impl ReaderError {
    pub fn config(msg: impl Into<String>) -> Self {
        ReaderError::Config(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        ReaderError::DataInconsistency(msg.into())
    }
}

// Mapping from string to error
impl From<String> for ReaderError {
    fn from(s: String) -> Self {
        ReaderError::Backend(AnyError::msg(s))
    }
}

impl From<&str> for ReaderError {
    fn from(s: &str) -> Self {
        ReaderError::Backend(AnyError::msg(s.to_string()))
    }
}
