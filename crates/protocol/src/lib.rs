//! # Warmpool wire protocol
//!
//! Messages exchanged between the pool manager and its worker processes.
//!
//! ## Wire format
//!
//! ```text
//! +----------------------------+----------------------------+
//! | Length (4 bytes, BE)       | JSON-encoded Frame body    |
//! +----------------------------+----------------------------+
//! ```
//!
//! A single connection carries many outstanding requests at once. Results are
//! paired with requests by `request_id` and dispatch `attempt`, never by stream
//! order.

mod codec;
mod error;
mod message;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
pub use error::ProtocolError;
pub use message::{
    ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, ExecutionStatus, Frame,
    RunContext,
};
