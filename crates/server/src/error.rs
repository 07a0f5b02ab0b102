//! Server error types, split so the binary can map them to exit codes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error at startup: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),
}
