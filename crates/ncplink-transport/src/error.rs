use ncplink_link::LinkError;
use thiserror::Error;

/// Errors surfaced by the transport adapter. Distinct from [`LinkError`]:
/// these are upper-layer concerns (one-command-at-a-time discipline,
/// response timeouts, malformed upper-protocol framing) layered on top of a
/// link that may itself still be healthy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link is not connected")]
    NotConnected,

    #[error("no response received within the allotted window")]
    ResponseTimeout,

    #[error("link-level error: {0:?}")]
    Link(LinkError),

    /// The upper header's direction bits didn't decode to a known
    /// direction, or a frame tagged `Command` arrived from the peer, which
    /// should never happen. Drops the frame; the link stays up.
    #[error("upper frame carries an invalid or unexpected direction")]
    WrongDirection,

    /// Fewer bytes arrived than the upper header alone requires.
    #[error("upper frame shorter than its header")]
    Truncated,

    /// A payload (header + body) did not fit the frame capacity.
    #[error("upper frame exceeds the maximum payload length")]
    Overflow,

    /// A `Response` frame's id didn't match the outstanding command, or
    /// arrived with no command outstanding at all.
    #[error("response frame id does not match the outstanding command")]
    InvalidFrameId,
}

impl From<LinkError> for TransportError {
    fn from(value: LinkError) -> Self {
        TransportError::Link(value)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
