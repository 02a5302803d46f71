//! Tunable link parameters and the reset strategy used to bring the peer up.

use core::time::Duration;

/// How the host brings the NCP out of reset before the RST/RSTACK handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    /// Send an RST frame over the already-open serial link.
    RstFrame,
    /// Pulse the reset line (DTR or similar) low for a fixed width.
    DtrPulse { hold: Duration },
    /// The host application performs the reset through its own out-of-band
    /// hook before calling into the link.
    Custom,
    /// The peer is assumed already reset; skip straight to the handshake.
    None,
}

/// Flow control method used on the serial line itself, not to be confused
/// with the link's own window/not-ready flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFlowControl {
    Hardware,
    Software,
    None,
}

/// Every tunable of a link session, bundled so a profile can be selected
/// wholesale and then overridden field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkProfile {
    pub baud_rate: u32,
    pub stop_bits: u8,
    pub flow_control: SerialFlowControl,
    pub window_size: u8,
    pub randomize: bool,
    pub ack_timer_min: Duration,
    pub ack_timer_max: Duration,
    pub ack_timer_initial: Duration,
    pub rst_ack_timeout: Duration,
    pub max_timeouts: u8,
    pub nr_high_water: usize,
    pub nr_low_water: usize,
    pub nr_refresh_period: Duration,
    pub reset_method: ResetMethod,
}

/// Retries before a link that keeps timing out is judged down, both for the
/// link engine's own retransmit ceiling and the transport adapter's
/// response-timeout multiplier.
pub const MAX_TIMEOUTS: u8 = 6;

impl LinkProfile {
    /// EM2xx NCP over RTS/CTS hardware flow control at 115200 baud.
    pub const fn ncp_rtscts_115200() -> Self {
        LinkProfile {
            baud_rate: 115_200,
            stop_bits: 1,
            flow_control: SerialFlowControl::Hardware,
            window_size: 4,
            randomize: true,
            ack_timer_min: Duration::from_millis(400),
            ack_timer_max: Duration::from_millis(2400),
            ack_timer_initial: Duration::from_millis(1600),
            rst_ack_timeout: Duration::from_millis(2500),
            max_timeouts: MAX_TIMEOUTS,
            nr_high_water: 4,
            nr_low_water: 2,
            nr_refresh_period: Duration::from_millis(160),
            reset_method: ResetMethod::RstFrame,
        }
    }

    /// EM2xx NCP over software (XON/XOFF) flow control at 57600 baud.
    pub const fn ncp_xonxoff_57600() -> Self {
        LinkProfile {
            baud_rate: 57_600,
            stop_bits: 1,
            flow_control: SerialFlowControl::Software,
            window_size: 1,
            randomize: true,
            ack_timer_min: Duration::from_millis(800),
            ack_timer_max: Duration::from_millis(3200),
            ack_timer_initial: Duration::from_millis(2400),
            rst_ack_timeout: Duration::from_millis(2500),
            max_timeouts: MAX_TIMEOUTS,
            nr_high_water: 2,
            nr_low_water: 1,
            nr_refresh_period: Duration::from_millis(320),
            reset_method: ResetMethod::RstFrame,
        }
    }

    /// AVR-based NCP over software flow control at 38400 baud.
    pub const fn avr_xonxoff_38400() -> Self {
        LinkProfile {
            baud_rate: 38_400,
            stop_bits: 1,
            flow_control: SerialFlowControl::Software,
            window_size: 1,
            randomize: true,
            ack_timer_min: Duration::from_millis(800),
            ack_timer_max: Duration::from_millis(3200),
            ack_timer_initial: Duration::from_millis(2400),
            rst_ack_timeout: Duration::from_millis(2500),
            max_timeouts: MAX_TIMEOUTS,
            nr_high_water: 2,
            nr_low_water: 1,
            nr_refresh_period: Duration::from_millis(320),
            reset_method: ResetMethod::DtrPulse { hold: Duration::from_millis(50) },
        }
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self::ncp_rtscts_115200()
    }
}
