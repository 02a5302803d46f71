//! Error taxonomy split by how the caller should react: try again later,
//! drop one frame, or tear the session down.

use crate::codec::FrameError;
use crate::frame::ResetReason;

/// Errors local to decoding or sending a single frame. The link stays up;
/// the offending frame is dropped (and, for inbound frames, a NAK or
/// duplicate ACK eventually resolves it).
pub type LocalFrameError = FrameError;

/// Conditions the local side detected that mean the session cannot
/// continue without a fresh reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFatalLocal {
    RstAckTimeout,
    MaxRetransmissionsExceeded,
    BufferPoolExhausted,
    /// A caller passed `send()` a payload too large to fit a pool buffer.
    CommandTooLong,
}

/// A top-level link error. `WouldBlock` is not an error condition at all,
/// just "nothing to do this tick"; it exists so `send`/`receive` share a
/// `Result` return type with the genuine failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    WouldBlock,
    Frame(LocalFrameError),
    SessionFatalLocal(SessionFatalLocal),
    SessionFatalPeer(ResetReason),
    NotConnected,
    WindowFull,
}

impl From<LocalFrameError> for LinkError {
    fn from(value: LocalFrameError) -> Self {
        LinkError::Frame(value)
    }
}
