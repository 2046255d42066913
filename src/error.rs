//!
//! Crate-wide error type.
//!
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O failures opening or reading inputs and outputs
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad command line or inconsistent model set
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Malformed pore model / transition / event table text
    #[error("parse error in {path}, line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}
