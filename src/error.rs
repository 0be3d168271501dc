
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommError>;

/// Things that can go wrong while setting up or running the server.  Most
/// per-connection trouble never surfaces here; a misbehaving socket just gets
/// its connection flagged for close.  These are for the failures that matter
/// to the process as a whole.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config problem: {0}")]
    Config(String),

    #[error("bad JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("can't use {addr} as an address: {reason}")]
    Address { addr: String, reason: String },
}
