use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop the worker server itself (never per-request outcomes)
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket
    #[error("failed to bind worker socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not install a signal handler
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// Invalid startup configuration
    #[error("invalid worker configuration: {0}")]
    Config(String),
}
