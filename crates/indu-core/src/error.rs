use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InduError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),
}

pub type InduResult<T> = Result<T, InduError>;
