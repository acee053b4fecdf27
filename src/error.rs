use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("no write permission on directory {}: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid root location: {0}")]
    InvalidRoot(#[from] url::ParseError),

    #[error("cancelled")]
    Cancelled,
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
