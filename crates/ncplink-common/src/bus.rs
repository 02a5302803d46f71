/// Abstraction over the physical serial link. The engine is generic over
/// this trait so that the same no_std state machine can run against a real
/// UART, a loopback pair in tests, or a pseudo-terminal on the host.
///
/// All operations are non-blocking: `WouldBlock` means "try again on the
/// next tick", never an error condition on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    WouldBlock,
    Io,
}

pub trait SerialRead {
    /// Reads the next available byte, or `Err(SerialError::WouldBlock)` if
    /// none is currently buffered.
    fn read_byte(&mut self) -> Result<u8, SerialError>;
}

pub trait SerialWrite {
    /// Queues a single byte for transmission. Returns
    /// `Err(SerialError::WouldBlock)` if the output buffer is full.
    fn write_byte(&mut self, byte: u8) -> Result<(), SerialError>;

    /// True while previously queued bytes are still draining.
    fn is_tx_busy(&self) -> bool;
}

/// Control surface for resetting the peer over the physical link, as
/// distinct from reading/writing frame bytes. Left abstract because the
/// DTR pulse is platform-sensitive and owned by the serial-driver
/// collaborator, not by this crate.
pub trait SerialControl {
    /// Asserts the reset line (if any), holds it, then releases it. A
    /// no-op for transports with no reset line (e.g. a loopback pair).
    fn pulse_reset(&mut self, hold: core::time::Duration);
}
