//! One-command-at-a-time transport on top of a [`LinkEngine`].
//!
//! The upper protocol this adapter carries is request/response: at most one
//! command may be outstanding at a time, and its response is the next DATA
//! payload tagged `Response` that the link delivers. A payload tagged
//! `Callback` is an unsolicited notification from the NCP and is delivered
//! to the caller the same way, whether or not a command is outstanding.
//!
//! Every payload carries a 2-byte header ahead of the caller's bytes:
//! `[control, frame_id]`. `control` packs the direction (Command/Response/
//! Callback) plus a sleep tag and a callback-pending bit; `frame_id`
//! correlates a response to the command that asked for it.

use heapless::{Deque, Vec as HVec};
use ncplink_common::bus::{SerialControl, SerialRead, SerialWrite};
use ncplink_common::time::Clock;
use ncplink_link::error::LinkError;
use ncplink_link::frame::MAX_PAYLOAD_LEN;
use ncplink_link::LinkEngine;

use crate::error::{TransportError, TransportResult};

type Payload = HVec<u8, MAX_PAYLOAD_LEN>;

/// Bytes of upper-layer framing ahead of the caller's payload: control byte
/// plus frame id.
const UPPER_HEADER_LEN: usize = 2;

/// Deferred callbacks are rare (a command is normally in flight briefly);
/// this just bounds the worst case so a misbehaving peer can't grow memory.
const MAX_PENDING_CALLBACKS: usize = 4;

/// The frame id reserved for the wake-up probe sent ahead of the first
/// command after an idle period with `keep_awake` set. Real commands never
/// use it because `next_frame_id` starts at 1 and wraps before reaching it
/// only every 255 commands, at which point it is simply skipped.
const WAKE_FRAME_ID: u8 = 0;

const DIR_COMMAND: u8 = 0;
const DIR_RESPONSE: u8 = 1;
const DIR_CALLBACK: u8 = 2;
const DIR_SHIFT: u8 = 6;
const DIR_MASK: u8 = 0b11;
const SLEEP_BIT: u8 = 1 << 5;
const CALLBACK_PENDING_BIT: u8 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpperDirection {
    Command,
    Response,
    Callback,
}

impl UpperDirection {
    const fn discriminant(self) -> u8 {
        match self {
            UpperDirection::Command => DIR_COMMAND,
            UpperDirection::Response => DIR_RESPONSE,
            UpperDirection::Callback => DIR_CALLBACK,
        }
    }

    const fn from_discriminant(value: u8) -> Option<UpperDirection> {
        match value {
            DIR_COMMAND => Some(UpperDirection::Command),
            DIR_RESPONSE => Some(UpperDirection::Response),
            DIR_CALLBACK => Some(UpperDirection::Callback),
            _ => None,
        }
    }
}

struct UpperHeader {
    direction: UpperDirection,
    sleeping: bool,
    callback_pending: bool,
    frame_id: u8,
}

pub(crate) fn encode_upper_header(direction: UpperDirection, sleeping: bool, callback_pending: bool, frame_id: u8) -> [u8; UPPER_HEADER_LEN] {
    let mut control = direction.discriminant() << DIR_SHIFT;
    if sleeping {
        control |= SLEEP_BIT;
    }
    if callback_pending {
        control |= CALLBACK_PENDING_BIT;
    }
    [control, frame_id]
}

fn decode_upper_header(raw: &[u8]) -> Result<UpperHeader, TransportError> {
    if raw.len() < UPPER_HEADER_LEN {
        return Err(TransportError::Truncated);
    }
    let control = raw[0];
    let direction = UpperDirection::from_discriminant((control >> DIR_SHIFT) & DIR_MASK)
        .ok_or(TransportError::WrongDirection)?;
    Ok(UpperHeader {
        direction,
        sleeping: control & SLEEP_BIT != 0,
        callback_pending: control & CALLBACK_PENDING_BIT != 0,
        frame_id: raw[1],
    })
}

/// How long the adapter waits for a response before giving up, expressed as
/// a multiple of the link's current adaptive ack period.
pub struct ResponseTimeoutPolicy {
    pub multiplier: u8,
}

impl Default for ResponseTimeoutPolicy {
    fn default() -> Self {
        ResponseTimeoutPolicy { multiplier: ncplink_link::MAX_TIMEOUTS }
    }
}

pub enum TransportEvent {
    /// The response to the command currently in flight.
    Response(Payload),
    /// An unsolicited payload from the peer.
    Callback(Payload),
}

pub struct TransportAdapter<const TX_N: usize, const RX_N: usize, C: Clock> {
    engine: LinkEngine<TX_N, RX_N, C>,
    clock: C,
    timeout_policy: ResponseTimeoutPolicy,
    awaiting_response: bool,
    command_sent_at: Option<C::TInstant>,
    outstanding_frame_id: u8,
    next_frame_id: u8,

    sleeping: bool,
    keep_awake: bool,
    awaiting_wake_ack: bool,

    callback_pending: bool,
    pending_callbacks: Deque<Payload, MAX_PENDING_CALLBACKS>,
    dropped_callbacks: u32,
}

impl<const TX_N: usize, const RX_N: usize, C: Clock> TransportAdapter<TX_N, RX_N, C> {
    pub fn new(engine: LinkEngine<TX_N, RX_N, C>, clock: C) -> Self {
        TransportAdapter {
            engine,
            clock,
            timeout_policy: ResponseTimeoutPolicy::default(),
            awaiting_response: false,
            command_sent_at: None,
            outstanding_frame_id: 0,
            next_frame_id: 1,
            sleeping: false,
            keep_awake: false,
            awaiting_wake_ack: false,
            callback_pending: false,
            pending_callbacks: Deque::new(),
            dropped_callbacks: 0,
        }
    }

    pub fn engine(&self) -> &LinkEngine<TX_N, RX_N, C> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut LinkEngine<TX_N, RX_N, C> {
        &mut self.engine
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// How many deferred callbacks have been dropped for want of a free
    /// slot, and therefore never delivered to the caller.
    pub fn dropped_callbacks(&self) -> u32 {
        self.dropped_callbacks
    }

    /// Whether the peer has signaled (via the callback-pending bit on its
    /// last frame) that it has a notification queued up for us.
    pub fn is_callback_pending(&self) -> bool {
        self.callback_pending
    }

    /// Marks the link as asleep, e.g. between polling intervals on a
    /// battery-sensitive host. While asleep, `send_command` and `poll` are
    /// both refused, and any command frame sent before the next `wake`
    /// carries the sleep tag so the peer knows not to expect further
    /// traffic until it sees an awake one.
    pub fn sleep(&mut self) {
        self.sleeping = true;
    }

    pub fn wake(&mut self) {
        self.sleeping = false;
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// If set, the first command issued after an idle period is preceded by
    /// a wake-up probe and the adapter waits for the peer's confirmation
    /// before sending the real command.
    pub fn set_keep_awake(&mut self, keep_awake: bool) {
        self.keep_awake = keep_awake;
        if !keep_awake {
            self.awaiting_wake_ack = false;
        }
    }

    /// Starts the handshake on the underlying link and resets the upper
    /// protocol's own state (in-flight command, deferred callbacks).
    pub fn init<Ctrl: SerialControl>(&mut self, ctrl: &mut Ctrl) {
        self.awaiting_response = false;
        self.command_sent_at = None;
        self.awaiting_wake_ack = false;
        self.callback_pending = false;
        self.pending_callbacks = Deque::new();
        self.engine.start(ctrl);
    }

    /// Tears the link down and discards any in-flight/deferred upper state.
    /// Calling `init` afterwards brings the link back up clean.
    pub fn close(&mut self) {
        self.engine.close();
        self.awaiting_response = false;
        self.command_sent_at = None;
        self.awaiting_wake_ack = false;
        self.callback_pending = false;
        self.pending_callbacks = Deque::new();
    }

    fn next_frame_id(&mut self) -> u8 {
        let id = self.next_frame_id;
        self.next_frame_id = if self.next_frame_id == u8::MAX { 1 } else { self.next_frame_id + 1 };
        if id == WAKE_FRAME_ID {
            self.next_frame_id()
        } else {
            id
        }
    }

    fn send_framed(&mut self, direction: UpperDirection, frame_id: u8, payload: &[u8]) -> TransportResult<()> {
        let header = encode_upper_header(direction, self.sleeping, self.callback_pending, frame_id);
        let mut framed: HVec<u8, MAX_PAYLOAD_LEN> = HVec::new();
        framed.extend_from_slice(&header).map_err(|_| TransportError::Overflow)?;
        framed.extend_from_slice(payload).map_err(|_| TransportError::Overflow)?;
        self.engine.send(&framed)?;
        Ok(())
    }

    /// Sends a command. Re-entrant calls while a previous command's
    /// response has not yet arrived are a caller bug, not a recoverable
    /// condition: the protocol only ever has one command in flight.
    ///
    /// Fails with a `Result` for the conditions a well-behaved caller can
    /// hit in the ordinary course of things: the link being down or
    /// asleep, or the payload not fitting a frame.
    pub fn send_command(&mut self, payload: &[u8]) -> TransportResult<()> {
        assert!(!self.awaiting_response, "send_command called while a response is still outstanding");
        if self.sleeping {
            return Err(TransportError::NotConnected);
        }
        if !self.engine.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.keep_awake && !self.awaiting_wake_ack {
            self.send_framed(UpperDirection::Command, WAKE_FRAME_ID, &[])?;
            self.awaiting_wake_ack = true;
            self.command_sent_at = Some(self.clock.current_instant());
            self.awaiting_response = true;
            self.outstanding_frame_id = WAKE_FRAME_ID;
            return Ok(());
        }
        let frame_id = self.next_frame_id();
        self.send_framed(UpperDirection::Command, frame_id, payload)?;
        self.outstanding_frame_id = frame_id;
        self.awaiting_response = true;
        self.command_sent_at = Some(self.clock.current_instant());
        Ok(())
    }

    fn response_timeout(&self) -> core::time::Duration {
        self.engine.ack_period() * self.timeout_policy.multiplier as u32
    }

    /// Checks whether the currently outstanding command has timed out.
    /// Clears `awaiting_response` on timeout so a fresh command can be
    /// issued; the caller is responsible for deciding whether to retry.
    pub fn check_timeout(&mut self) -> TransportResult<()> {
        if !self.awaiting_response {
            return Ok(());
        }
        if let Some(sent_at) = self.command_sent_at {
            if self.clock.elapsed(sent_at) >= self.response_timeout() {
                self.awaiting_response = false;
                self.command_sent_at = None;
                self.awaiting_wake_ack = false;
                return Err(TransportError::ResponseTimeout);
            }
        }
        Ok(())
    }

    fn queue_callback(&mut self, payload: Payload) {
        if self.pending_callbacks.is_full() {
            self.pending_callbacks.pop_front();
            self.dropped_callbacks += 1;
        }
        let _ = self.pending_callbacks.push_back(payload);
    }

    /// Classifies one raw payload drained off the link and either returns it
    /// to the caller immediately or, if a command is still outstanding,
    /// defers a callback until the response has been delivered.
    fn dispatch_upper(&mut self, raw: &[u8]) -> TransportResult<Option<TransportEvent>> {
        let header = decode_upper_header(raw)?;
        self.callback_pending = header.callback_pending;
        let body = &raw[UPPER_HEADER_LEN..];
        let mut payload: Payload = HVec::new();
        payload.extend_from_slice(body).map_err(|_| TransportError::Overflow)?;

        match header.direction {
            UpperDirection::Command => Err(TransportError::WrongDirection),
            UpperDirection::Response => {
                if !self.awaiting_response {
                    return Err(TransportError::InvalidFrameId);
                }
                if header.frame_id != self.outstanding_frame_id {
                    return Err(TransportError::InvalidFrameId);
                }
                self.awaiting_response = false;
                self.command_sent_at = None;
                if self.outstanding_frame_id == WAKE_FRAME_ID {
                    self.awaiting_wake_ack = false;
                    return Ok(None);
                }
                Ok(Some(TransportEvent::Response(payload)))
            }
            UpperDirection::Callback => {
                if self.awaiting_response {
                    self.queue_callback(payload);
                    Ok(None)
                } else {
                    Ok(Some(TransportEvent::Callback(payload)))
                }
            }
        }
    }

    /// Drains whatever bytes are available on the bus, feeding them through
    /// the link engine, and returns the next event ready for the caller.
    /// Returns `Ok(None)` once there is nothing left to read this tick.
    pub fn poll<R: SerialRead>(&mut self, bus: &mut R) -> TransportResult<Option<TransportEvent>> {
        if self.sleeping {
            return Ok(None);
        }
        loop {
            match self.engine.receive_exec(bus) {
                Ok(Some(_)) => {
                    let mut out = [0u8; MAX_PAYLOAD_LEN];
                    let len = self
                        .engine
                        .take_received(&mut out)
                        .ok_or(TransportError::Truncated)?;
                    match self.dispatch_upper(&out[..len])? {
                        Some(event) => return Ok(Some(event)),
                        None => continue,
                    }
                }
                Ok(None) => continue,
                Err(LinkError::WouldBlock) => {
                    if !self.awaiting_response {
                        if let Some(payload) = self.pending_callbacks.pop_front() {
                            return Ok(Some(TransportEvent::Callback(payload)));
                        }
                    }
                    return Ok(None);
                }
                Err(LinkError::Frame(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Drives outbound frames and link timers. Call once per loop
    /// iteration alongside [`Self::poll`]. `bus` doubles as the reset
    /// control surface, since on real hardware the same serial handle
    /// usually owns both.
    pub fn tick<T: SerialWrite + SerialControl>(&mut self, bus: &mut T) {
        if self.sleeping {
            return;
        }
        self.engine.tick(bus);
        loop {
            match self.engine.send_exec(bus) {
                Ok(()) => continue,
                Err(_) => break,
            }
        }
    }
}
