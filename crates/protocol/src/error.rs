use thiserror::Error;

/// Transport-level failures. These never describe an action outcome.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Length header announced an empty body
    #[error("received a zero-length frame")]
    EmptyFrame,

    /// Length header exceeds the configured ceiling
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Body could not be decoded into a frame
    #[error("malformed frame body: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Frame could not be serialized
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}
