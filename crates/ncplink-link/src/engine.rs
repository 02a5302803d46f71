//! The link engine: connection state machine, sliding-window ACK/NAK
//! protocol, and Not-Ready flow control, driven one tick at a time by the
//! host application.

use ncplink_common::bus::{SerialControl, SerialRead, SerialWrite};
use ncplink_common::time::Clock;
use ncplink_common::{dev_info, dev_warn};

use crate::codec::{encode_frame, DecodeEvent, FlowSignal, FrameDecoder};
use crate::counters::Counters;
use crate::error::{LinkError, SessionFatalLocal};
use crate::frame::{Control, FrameKind, ResetReason, RstAckBody, SeqByte, MAX_BODY_LEN};
use crate::pool::{Index, Pool};
use crate::profile::{LinkProfile, ResetMethod};
use crate::queue::Queue;
use crate::timer::AckTimer;

const PROTOCOL_VERSION_MAJOR: u8 = 2;
const PROTOCOL_VERSION_MINOR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingRstAck,
    Connected,
    Failed,
}

/// One frame queued for transmission or awaiting acknowledgement. Holds its
/// own FRM number and retransmit flag alongside the payload buffer index so
/// `send_exec` can re-encode it unchanged on a retry.
#[derive(Clone, Copy)]
struct PendingTx {
    frm: u8,
    buffer: Index,
    retransmit: bool,
}

/// The transmit pool must hold `rx_pool + TX_POOL_HEADROOM` buffers: one
/// slot per receive-side ACK in flight, the retransmit window, one
/// spontaneous ACK, and one command — see `LinkEngine::new`'s compile-time
/// assertion.
pub const TX_POOL_HEADROOM: usize = 5;

/// Window-bounded, sliding-ACK link engine over a fixed-size buffer arena.
/// `TX_N`/`RX_N` bound how many outbound and inbound payloads can be in
/// flight at once; neither has any relation to the protocol's window size,
/// which is a runtime [`LinkProfile`] field clamped to be no larger than
/// `TX_N`.
pub struct LinkEngine<const TX_N: usize, const RX_N: usize, C: Clock> {
    clock: C,
    profile: LinkProfile,
    state: LinkState,
    decoder: FrameDecoder,

    tx_pool: Pool<TX_N>,
    tx_queue: Queue,
    retransmit_queue: Queue,
    tx_meta: [Option<PendingTx>; TX_N],

    rx_pool: Pool<RX_N>,
    rx_queue: Queue,

    next_frm_out: u8,
    next_frm_expected: u8,
    last_ack_sent: u8,
    force_ack: bool,
    nak_owed: Option<u8>,

    peer_not_ready: bool,
    local_not_ready: bool,

    ack_timer: AckTimer,
    retransmit_deadline: Option<C::TInstant>,
    rst_deadline: Option<C::TInstant>,
    nr_deadline: Option<C::TInstant>,
    retransmit_sent_at: Option<C::TInstant>,
    timeout_count: u8,

    counters: Counters,
    last_reset_reason: Option<ResetReason>,
    last_local_fatal: Option<SessionFatalLocal>,
}

impl<const TX_N: usize, const RX_N: usize, C: Clock> LinkEngine<TX_N, RX_N, C> {
    /// Evaluated at monomorphization: fails to compile for any `TX_N`/`RX_N`
    /// pair that does not carry the spec's `rx_pool + 5` headroom.
    const TX_HEADROOM_CHECK: () = assert!(
        TX_N == RX_N + TX_POOL_HEADROOM,
        "tx_pool must be sized rx_pool + TX_POOL_HEADROOM"
    );

    pub fn new(clock: C, profile: LinkProfile) -> Self {
        let _ = Self::TX_HEADROOM_CHECK;
        LinkEngine {
            clock,
            ack_timer: AckTimer::new(
                profile.ack_timer_initial,
                profile.ack_timer_min,
                profile.ack_timer_max,
            ),
            profile,
            state: LinkState::Disconnected,
            decoder: FrameDecoder::new(),
            tx_pool: Pool::new(),
            tx_queue: Queue::new(),
            retransmit_queue: Queue::new(),
            tx_meta: [None; TX_N],
            rx_pool: Pool::new(),
            rx_queue: Queue::new(),
            next_frm_out: 0,
            next_frm_expected: 0,
            last_ack_sent: 0,
            force_ack: false,
            nak_owed: None,
            peer_not_ready: false,
            local_not_ready: false,
            retransmit_deadline: None,
            rst_deadline: None,
            nr_deadline: None,
            retransmit_sent_at: None,
            timeout_count: 0,
            counters: Counters::new(),
            last_reset_reason: None,
            last_local_fatal: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Whether the local side is currently advertising Not-Ready to the
    /// peer (rx buffers running low).
    pub fn is_local_not_ready(&self) -> bool {
        self.local_not_ready
    }

    /// Current adaptive ack period, for collaborators (e.g. the transport
    /// adapter) that derive their own timeouts as a multiple of it.
    pub fn ack_period(&self) -> core::time::Duration {
        self.ack_timer.period()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn counters(&mut self) -> &mut Counters {
        &mut self.counters
    }

    pub fn last_reset_reason(&self) -> Option<ResetReason> {
        self.last_reset_reason
    }

    /// Which locally detected condition drove the last transition to
    /// `Failed`, if any. `None` when the last fatal transition (if there
    /// was one) was peer-driven instead; see [`Self::last_reset_reason`].
    pub fn last_local_fatal(&self) -> Option<SessionFatalLocal> {
        self.last_local_fatal
    }

    /// Begins (or restarts) the handshake: drives the reset strategy, clears
    /// all queues, and waits for RSTACK.
    pub fn reset_peer<Ctrl: SerialControl>(&mut self, ctrl: &mut Ctrl) {
        match self.profile.reset_method {
            ResetMethod::DtrPulse { hold } => ctrl.pulse_reset(hold),
            ResetMethod::RstFrame | ResetMethod::Custom | ResetMethod::None => {}
        }
        self.drain_queues();
        self.state = LinkState::AwaitingRstAck;
        self.rst_deadline = Some(self.origin());
        self.timeout_count = 0;
        dev_info!("ncplink: reset_peer, awaiting RSTACK");
    }

    /// Entry point the host calls once at startup; equivalent to
    /// `reset_peer` when no application-level reset hook is needed.
    pub fn start<Ctrl: SerialControl>(&mut self, ctrl: &mut Ctrl) {
        self.reset_peer(ctrl);
    }

    /// Flushes all queued and in-flight state and returns the link to
    /// `Disconnected`. The caller owns the serial port itself; this only
    /// tears down protocol state so a fresh `start()` begins clean.
    pub fn close(&mut self) {
        self.drain_queues();
        self.state = LinkState::Disconnected;
    }

    fn drain_queues(&mut self) {
        while let Some(idx) = self.tx_queue.pop_head(&mut self.tx_pool) {
            self.tx_pool.free(idx);
        }
        while let Some(idx) = self.retransmit_queue.pop_head(&mut self.tx_pool) {
            self.tx_pool.free(idx);
        }
        while let Some(idx) = self.rx_queue.pop_head(&mut self.rx_pool) {
            self.rx_pool.free(idx);
        }
        self.tx_meta = [None; TX_N];
        self.next_frm_out = 0;
        self.next_frm_expected = 0;
        self.last_ack_sent = 0;
        self.force_ack = false;
        self.nak_owed = None;
        self.peer_not_ready = false;
        self.local_not_ready = false;
        self.retransmit_deadline = None;
        self.retransmit_sent_at = None;
        self.last_local_fatal = None;
    }

    /// Deadlines are tracked as an origin instant plus a duration resolved
    /// through `Clock::elapsed`, rather than a raw future instant, since
    /// `Clock` has no way to add a `Duration` to a `TInstant`.
    fn origin(&self) -> C::TInstant {
        self.clock.current_instant()
    }

    fn is_past(&self, origin: C::TInstant, delay: core::time::Duration) -> bool {
        self.clock.elapsed(origin) >= delay
    }

    /// Advances timers: RSTACK timeout, retransmit timeout, and the
    /// Not-Ready refresh tick. Should be called roughly as often as the
    /// host reads bytes off the bus.
    pub fn tick<Ctrl: SerialControl>(&mut self, ctrl: &mut Ctrl) {
        match self.state {
            LinkState::AwaitingRstAck => {
                if let Some(origin) = self.rst_deadline {
                    if self.is_past(origin, self.profile.rst_ack_timeout) {
                        self.timeout_count += 1;
                        if self.timeout_count >= self.profile.max_timeouts {
                            self.state = LinkState::Failed;
                            self.last_local_fatal = Some(SessionFatalLocal::RstAckTimeout);
                            dev_warn!("ncplink: RSTACK timeout exceeded retry budget");
                        } else {
                            self.reset_peer(ctrl);
                        }
                    }
                }
            }
            LinkState::Connected => {
                if let Some(origin) = self.retransmit_deadline {
                    if self.is_past(origin, self.ack_timer.period()) {
                        self.on_retransmit_timeout();
                    }
                }
                if self.local_not_ready {
                    if let Some(origin) = self.nr_deadline {
                        if self.is_past(origin, self.profile.nr_refresh_period) {
                            self.nr_deadline = Some(self.clock.current_instant());
                            self.force_ack = true;
                        }
                    }
                }
            }
            LinkState::Disconnected | LinkState::Failed => {}
        }
    }

    fn on_retransmit_timeout(&mut self) {
        self.ack_timer.on_timeout();
        self.counters.ack_timeouts += 1;
        self.timeout_count += 1;
        if self.timeout_count >= self.profile.max_timeouts {
            self.state = LinkState::Failed;
            self.last_local_fatal = Some(SessionFatalLocal::MaxRetransmissionsExceeded);
            dev_warn!("ncplink: max retransmissions exceeded");
            return;
        }
        if let Some(idx) = self.retransmit_queue.peek_head() {
            if let Some(meta) = self.tx_meta[idx as usize].as_mut() {
                meta.retransmit = true;
            }
            self.retransmit_sent_at = Some(self.clock.current_instant());
            self.retransmit_deadline = Some(self.clock.current_instant());
        }
    }

    /// Queues a payload for transmission. Fails with
    /// [`LinkError::WindowFull`] if the retransmit window (Testable
    /// Property 4) is already saturated, [`LinkError::NotConnected`]
    /// outside the `Connected` state, or [`crate::codec::FrameError::TooShort`]
    /// for an empty payload. A payload too large to fit a buffer is a
    /// caller bug, not a recoverable condition: it latches
    /// `SessionFatalLocal::CommandTooLong` and fails the session.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        if payload.is_empty() {
            self.counters.too_short_errors += 1;
            return Err(LinkError::Frame(crate::codec::FrameError::TooShort));
        }
        if self.retransmit_queue.length() >= self.profile.window_size as usize {
            return Err(LinkError::WindowFull);
        }
        let idx = self
            .tx_pool
            .alloc()
            .ok_or(LinkError::SessionFatalLocal(SessionFatalLocal::BufferPoolExhausted))?;
        if !self.tx_pool.buffer_mut(idx).fill(payload) {
            self.tx_pool.free(idx);
            self.state = LinkState::Failed;
            self.last_local_fatal = Some(SessionFatalLocal::CommandTooLong);
            return Err(LinkError::SessionFatalLocal(SessionFatalLocal::CommandTooLong));
        }
        self.tx_meta[idx as usize] = Some(PendingTx { frm: 0, buffer: idx, retransmit: false });
        self.tx_queue.push_tail(&mut self.tx_pool, idx);
        Ok(())
    }

    /// Drives outbound traffic following the send algorithm's priority
    /// order: an owed NAK or forced ACK first, then fresh DATA if the
    /// window has room, then a timed-out retransmission. Call repeatedly
    /// until it returns `Err(LinkError::WouldBlock)`.
    pub fn send_exec<W: SerialWrite>(&mut self, bus: &mut W) -> Result<(), LinkError> {
        if self.state != LinkState::AwaitingRstAck && self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        if self.state == LinkState::AwaitingRstAck {
            return self.send_rst(bus);
        }

        if let Some(frm_rx) = self.nak_owed {
            return self.send_nak(bus, frm_rx);
        }
        if self.force_ack || self.last_ack_sent != self.next_frm_expected {
            return self.send_bare_ack(bus);
        }

        if !self.peer_not_ready
            && self.retransmit_queue.length() < self.profile.window_size as usize
        {
            if let Some(idx) = self.tx_queue.pop_head(&mut self.tx_pool) {
                let frm = self.next_frm_out;
                self.next_frm_out = (self.next_frm_out + 1) % 8;
                if let Some(meta) = self.tx_meta[idx as usize].as_mut() {
                    meta.frm = frm;
                }
                self.retransmit_queue.push_tail(&mut self.tx_pool, idx);
                self.write_data_frame(bus, idx, frm, false)?;
                self.retransmit_sent_at = Some(self.clock.current_instant());
                self.retransmit_deadline = Some(self.clock.current_instant());
                return Ok(());
            }
        }

        if let Some((idx, frm)) = self.next_marked_retransmit() {
            self.write_data_frame(bus, idx, frm, true)?;
            if let Some(meta) = self.tx_meta[idx as usize].as_mut() {
                meta.retransmit = false;
            }
            self.retransmit_sent_at = Some(self.clock.current_instant());
            self.retransmit_deadline = Some(self.clock.current_instant());
            return Ok(());
        }

        if self.peer_not_ready {
            return Err(LinkError::WindowFull);
        }
        Err(LinkError::WouldBlock)
    }

    /// Walks the retransmit queue from the head looking for an entry the
    /// timeout handler marked for resend. Entries ahead of it in the queue
    /// have already been resent and had their flag cleared this round.
    fn next_marked_retransmit(&self) -> Option<(Index, u8)> {
        let mut cur = self.retransmit_queue.peek_head();
        while let Some(idx) = cur {
            if let Some(meta) = self.tx_meta[idx as usize] {
                if meta.retransmit {
                    return Some((idx, meta.frm));
                }
            }
            cur = self.tx_pool.next[idx as usize];
        }
        None
    }

    /// Marks every entry currently in the retransmit queue for resend, as
    /// the NAK handler does ("the NAK'd frame and everything after it").
    fn mark_all_for_retransmit(&mut self) {
        let mut cur = self.retransmit_queue.peek_head();
        while let Some(idx) = cur {
            if let Some(meta) = self.tx_meta[idx as usize].as_mut() {
                meta.retransmit = true;
            }
            cur = self.tx_pool.next[idx as usize];
        }
    }

    fn write_data_frame<W: SerialWrite>(
        &mut self,
        bus: &mut W,
        idx: Index,
        frm: u8,
        retransmit: bool,
    ) -> Result<(), LinkError> {
        let control = Control::new(FrameKind::Data, retransmit, self.local_not_ready);
        let seq = SeqByte { frm, ack: self.next_frm_expected };
        let payload_len = self.tx_pool.buffer(idx).len;
        let mut scratch = [0u8; MAX_BODY_LEN * 2 + 4];
        let payload = {
            let buf = self.tx_pool.buffer(idx);
            let mut tmp = [0u8; crate::frame::MAX_PAYLOAD_LEN];
            tmp[..payload_len].copy_from_slice(buf.as_slice());
            tmp
        };
        let len = encode_frame(control, seq, &payload[..payload_len], &mut scratch)
            .ok_or_else(|| self.fatal_command_too_long())?;
        self.write_all(bus, &scratch[..len])?;
        self.last_ack_sent = self.next_frm_expected;
        self.force_ack = false;
        self.counters.data_frames_sent += 1;
        self.counters.data_bytes_sent += payload_len as u32;
        if retransmit {
            self.counters.retransmit_frames_sent += 1;
        }
        if control.not_ready {
            self.counters.nflag_frames_sent += 1;
        }
        Ok(())
    }

    /// Sends a bare ACK when there is nothing queued to piggyback one on,
    /// or when an already-delivered ACK number must be resent (a duplicate
    /// frame's ack, or refreshing Not-Ready clearance) so the peer's window
    /// does not stall.
    fn send_bare_ack<W: SerialWrite>(&mut self, bus: &mut W) -> Result<(), LinkError> {
        let control = Control::new(FrameKind::Ack, false, self.local_not_ready);
        let seq = SeqByte { frm: 0, ack: self.next_frm_expected };
        let mut scratch = [0u8; 16];
        let len = encode_frame(control, seq, &[], &mut scratch)
            .ok_or_else(|| self.fatal_command_too_long())?;
        self.write_all(bus, &scratch[..len])?;
        self.last_ack_sent = self.next_frm_expected;
        self.force_ack = false;
        self.counters.ack_frames_sent += 1;
        if control.not_ready {
            self.counters.nflag_frames_sent += 1;
        }
        Ok(())
    }

    /// Sends a NAK for `frm_rx`, the frame number the peer should resume
    /// retransmitting from.
    fn send_nak<W: SerialWrite>(&mut self, bus: &mut W, frm_rx: u8) -> Result<(), LinkError> {
        let control = Control::new(FrameKind::Nak, false, self.local_not_ready);
        let seq = SeqByte { frm: 0, ack: frm_rx };
        let mut scratch = [0u8; 16];
        let len = encode_frame(control, seq, &[], &mut scratch)
            .ok_or_else(|| self.fatal_command_too_long())?;
        self.write_all(bus, &scratch[..len])?;
        self.last_ack_sent = self.next_frm_expected;
        self.nak_owed = None;
        self.counters.nak_frames_sent += 1;
        if control.not_ready {
            self.counters.nflag_frames_sent += 1;
        }
        Ok(())
    }

    fn send_rst<W: SerialWrite>(&mut self, bus: &mut W) -> Result<(), LinkError> {
        let control = Control::new(FrameKind::Rst, false, false);
        let mut scratch = [0u8; 16];
        let len = encode_frame(control, SeqByte::default(), &[], &mut scratch)
            .ok_or_else(|| self.fatal_command_too_long())?;
        self.write_all(bus, &scratch[..len])?;
        self.counters.rst_frames_sent += 1;
        Err(LinkError::WouldBlock)
    }

    fn write_all<W: SerialWrite>(&mut self, bus: &mut W, bytes: &[u8]) -> Result<(), LinkError> {
        for &byte in bytes {
            loop {
                match bus.write_byte(byte) {
                    Ok(()) => break,
                    Err(ncplink_common::bus::SerialError::WouldBlock) => continue,
                    Err(ncplink_common::bus::SerialError::Io) => {
                        return Err(LinkError::SessionFatalLocal(
                            SessionFatalLocal::MaxRetransmissionsExceeded,
                        ))
                    }
                }
            }
        }
        self.counters.bytes_sent += bytes.len() as u32;
        self.counters.blocks_sent += 1;
        Ok(())
    }

    /// A frame that cannot be re-encoded into its scratch buffer means a
    /// payload `send()` already validated no longer fits — a caller-side
    /// invariant broke, not a wire condition. Session-fatal, not a per-frame
    /// drop.
    fn fatal_command_too_long(&mut self) -> LinkError {
        self.state = LinkState::Failed;
        self.last_local_fatal = Some(SessionFatalLocal::CommandTooLong);
        LinkError::SessionFatalLocal(SessionFatalLocal::CommandTooLong)
    }

    /// Pulls and processes a single inbound byte. Returns
    /// `Ok(Some(payload_len))` when a DATA frame's payload is ready to be
    /// copied out with [`Self::take_received`], `Ok(None)` for anything
    /// else handled internally, and an error for anything the caller should
    /// react to.
    pub fn receive_exec<R: SerialRead>(&mut self, bus: &mut R) -> Result<Option<usize>, LinkError> {
        let byte = bus
            .read_byte()
            .map_err(|_| LinkError::WouldBlock)?;
        self.receive(byte)
    }

    /// Feeds one already-read byte into the frame decoder and reacts to
    /// whatever event falls out.
    pub fn receive(&mut self, byte: u8) -> Result<Option<usize>, LinkError> {
        self.counters.bytes_received += 1;
        match self.decoder.process_byte(byte) {
            DecodeEvent::Pending => Ok(None),
            DecodeEvent::Flow(FlowSignal::Xoff) => {
                self.peer_not_ready = true;
                Ok(None)
            }
            DecodeEvent::Flow(FlowSignal::Xon) => {
                self.peer_not_ready = false;
                Ok(None)
            }
            DecodeEvent::Error(err) => {
                self.counters.blocks_received += 1;
                use crate::codec::FrameError;
                match err {
                    FrameError::CrcMismatch => self.counters.crc_errors += 1,
                    FrameError::IoSubstituted => self.counters.comm_errors += 1,
                    FrameError::BadControlByte => self.counters.bad_control_errors += 1,
                    FrameError::Truncated => self.counters.bad_length_errors += 1,
                    FrameError::Oversized => self.counters.too_long_errors += 1,
                    FrameError::Cancelled => self.counters.cancels_received += 1,
                    // TooShort and BadAck are raised by `send`/`ack_window`
                    // respectively; the decoder never produces them.
                    FrameError::TooShort | FrameError::BadAck => {}
                }
                // A deliberate CANCEL is the sender discarding its own
                // half-sent frame, not corruption; nothing to NAK there.
                if !matches!(err, FrameError::Cancelled) {
                    self.nak_owed = Some(self.next_frm_expected);
                }
                Err(LinkError::Frame(err))
            }
            DecodeEvent::Frame(frame) => {
                self.counters.blocks_received += 1;
                if frame.control.not_ready {
                    self.counters.nflag_frames_received += 1;
                }
                self.on_frame(frame)
            }
        }
    }

    fn on_frame(&mut self, frame: crate::codec::RawFrame) -> Result<Option<usize>, LinkError> {
        match frame.control.kind {
            FrameKind::Rst => {
                self.counters.rst_frames_received += 1;
                Ok(None)
            }
            FrameKind::RstAck => {
                self.counters.rstack_frames_received += 1;
                let body = decode_rstack_body(&frame.payload);
                self.last_reset_reason = Some(body.reason);
                self.state = LinkState::Connected;
                self.rst_deadline = None;
                self.timeout_count = 0;
                dev_info!("ncplink: RSTACK received, link connected");
                Ok(None)
            }
            FrameKind::Error => {
                self.counters.error_frames_received += 1;
                let reason = frame
                    .payload
                    .first()
                    .map(|&b| ResetReason::from_code(b))
                    .unwrap_or(ResetReason::Unknown);
                self.last_reset_reason = Some(reason);
                self.state = LinkState::Failed;
                dev_warn!("ncplink: peer sent ERROR frame, session fatal");
                Err(LinkError::SessionFatalPeer(reason))
            }
            FrameKind::Ack => {
                self.counters.ack_frames_received += 1;
                self.peer_not_ready = frame.control.not_ready;
                self.ack_window(frame.seq.ack);
                Ok(None)
            }
            FrameKind::Nak => {
                self.counters.nak_frames_received += 1;
                self.peer_not_ready = frame.control.not_ready;
                self.ack_window(frame.seq.ack);
                self.retransmit_now();
                Ok(None)
            }
            FrameKind::Data => {
                self.counters.data_frames_received += 1;
                if frame.control.retransmit {
                    self.counters.retransmit_frames_received += 1;
                }
                self.peer_not_ready = frame.control.not_ready;
                if frame.seq.frm != self.next_frm_expected {
                    let last_accepted = (self.next_frm_expected + 7) % 8;
                    if frame.seq.frm == last_accepted {
                        // The peer never saw our ACK; re-ack without
                        // re-enqueuing the payload.
                        self.force_ack = true;
                        self.counters.duplicate_frames += 1;
                    } else {
                        self.nak_owed = Some(self.next_frm_expected);
                        self.counters.out_of_sequence_errors += 1;
                    }
                    return Ok(None);
                }
                self.ack_window(frame.seq.ack);
                self.next_frm_expected = (self.next_frm_expected + 1) % 8;
                let len = frame.payload.len();
                match self.rx_pool.alloc() {
                    Some(idx) => {
                        self.rx_pool.buffer_mut(idx).fill(&frame.payload);
                        self.rx_queue.push_tail(&mut self.rx_pool, idx);
                        self.counters.data_bytes_received += len as u32;
                        self.update_local_not_ready();
                        Ok(Some(len))
                    }
                    None => {
                        self.counters.no_buffer_errors += 1;
                        Err(LinkError::SessionFatalLocal(SessionFatalLocal::BufferPoolExhausted))
                    }
                }
            }
        }
    }

    /// Whether `ack` names a frame this side could plausibly be
    /// acknowledging: either the next FRM this side has yet to send, or
    /// the FRM of some entry still sitting in the retransmit queue.
    /// Anything else is a bogus ack number and must not touch the queue.
    fn ack_in_range(&self, ack: u8) -> bool {
        if ack == self.next_frm_out {
            return true;
        }
        let mut cur = self.retransmit_queue.peek_head();
        while let Some(idx) = cur {
            if let Some(meta) = self.tx_meta[idx as usize] {
                if meta.frm == ack {
                    return true;
                }
            }
            cur = self.tx_pool.next[idx as usize];
        }
        false
    }

    /// Retires every retransmit-queue entry with FRM strictly before `ack`
    /// (mod 8 sliding window), freeing their buffers, and feeds the
    /// observed round trip into the adaptive retransmit timer.
    fn ack_window(&mut self, ack: u8) {
        if !self.ack_in_range(ack) {
            self.counters.bad_ack_errors += 1;
            return;
        }
        let rtt_origin = self.retransmit_sent_at;
        let mut freed_any = false;
        loop {
            let Some(idx) = self.retransmit_queue.peek_head() else { break };
            let Some(meta) = self.tx_meta[idx as usize] else { break };
            if meta.frm == ack {
                break;
            }
            self.retransmit_queue.pop_head(&mut self.tx_pool);
            self.tx_meta[idx as usize] = None;
            self.tx_pool.free(idx);
            freed_any = true;
        }
        if !freed_any {
            return;
        }
        if let Some(origin) = rtt_origin {
            self.ack_timer.on_ack_received(self.clock.elapsed(origin));
        }
        if self.retransmit_queue.is_empty() {
            self.retransmit_deadline = None;
            self.retransmit_sent_at = None;
        } else {
            self.retransmit_sent_at = Some(self.clock.current_instant());
            self.retransmit_deadline = Some(self.clock.current_instant());
        }
    }

    /// A NAK arrived: the peer wants the NAK'd frame and everything after
    /// it resent, so the whole outstanding window is marked, not just its
    /// head.
    fn retransmit_now(&mut self) {
        if !self.retransmit_queue.is_empty() {
            self.mark_all_for_retransmit();
            self.retransmit_sent_at = Some(self.clock.current_instant());
            self.retransmit_deadline = Some(self.clock.current_instant());
        }
    }

    /// Copies out the oldest received payload, if any, and frees its
    /// buffer.
    pub fn take_received(&mut self, out: &mut [u8]) -> Option<usize> {
        let idx = self.rx_queue.pop_head(&mut self.rx_pool)?;
        let buf = self.rx_pool.buffer(idx);
        let len = buf.len.min(out.len());
        out[..len].copy_from_slice(&buf.as_slice()[..len]);
        self.rx_pool.free(idx);
        self.update_local_not_ready();
        Some(len)
    }

    /// True when the rx free list has fallen to the low-water mark and the
    /// local side should start advertising Not-Ready.
    pub fn should_assert_not_ready(&self) -> bool {
        self.rx_pool.available() <= self.profile.nr_low_water
    }

    /// True when the rx free list has climbed back to the high-water mark
    /// and a standing Not-Ready advertisement should be lifted.
    pub fn should_clear_not_ready(&self) -> bool {
        self.rx_pool.available() >= self.profile.nr_high_water
    }

    pub fn set_local_not_ready(&mut self, not_ready: bool) {
        self.local_not_ready = not_ready;
        if not_ready {
            self.nr_deadline = Some(self.clock.current_instant());
        } else {
            self.nr_deadline = None;
            // "clear it and send a bare ACK to refresh immediately"
            self.force_ack = true;
        }
    }

    /// Re-evaluates Not-Ready against the current rx free-list occupancy.
    /// Called after any change to it (a DATA frame accepted, a payload
    /// drained via `take_received`).
    fn update_local_not_ready(&mut self) {
        if !self.local_not_ready && self.should_assert_not_ready() {
            self.set_local_not_ready(true);
        } else if self.local_not_ready && self.should_clear_not_ready() {
            self.set_local_not_ready(false);
        }
    }
}

fn decode_rstack_body(payload: &heapless::Vec<u8, { crate::frame::MAX_PAYLOAD_LEN }>) -> RstAckBody {
    RstAckBody {
        version_major: payload.first().copied().unwrap_or(PROTOCOL_VERSION_MAJOR),
        version_minor: payload.get(1).copied().unwrap_or(PROTOCOL_VERSION_MINOR),
        reason: payload.get(2).copied().map(ResetReason::from_code).unwrap_or(ResetReason::Unknown),
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::time::Duration;
    use ncplink_common::time::TimeDiff;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone)]
    struct TestClock {
        now: Rc<RefCell<u64>>,
    }

    impl TestClock {
        fn new() -> Self {
            TestClock { now: Rc::new(RefCell::new(0)) }
        }

        fn advance(&self, ms: u64) {
            *self.now.borrow_mut() += ms;
        }
    }

    impl Clock for TestClock {
        type TInstant = u64;

        fn current_instant(&self) -> u64 {
            *self.now.borrow()
        }

        fn diff(&self, newer: u64, older: u64) -> TimeDiff {
            if newer >= older {
                TimeDiff::Forward(core::time::Duration::from_millis(newer - older))
            } else {
                TimeDiff::Backward(core::time::Duration::from_millis(older - newer))
            }
        }
    }

    struct Loopback {
        bytes: Vec<u8>,
        cursor: usize,
    }

    impl Loopback {
        fn new() -> Self {
            Loopback { bytes: Vec::new(), cursor: 0 }
        }
    }

    impl SerialRead for Loopback {
        fn read_byte(&mut self) -> Result<u8, ncplink_common::bus::SerialError> {
            if self.cursor < self.bytes.len() {
                let b = self.bytes[self.cursor];
                self.cursor += 1;
                Ok(b)
            } else {
                Err(ncplink_common::bus::SerialError::WouldBlock)
            }
        }
    }

    impl SerialWrite for Loopback {
        fn write_byte(&mut self, byte: u8) -> Result<(), ncplink_common::bus::SerialError> {
            self.bytes.push(byte);
            Ok(())
        }

        fn is_tx_busy(&self) -> bool {
            false
        }
    }

    struct NoopControl;
    impl SerialControl for NoopControl {
        fn pulse_reset(&mut self, _hold: core::time::Duration) {}
    }

    fn connect(engine: &mut LinkEngine<9, 4, TestClock>) {
        let mut ctrl = NoopControl;
        engine.start(&mut ctrl);
        let mut bus = Loopback::new();
        let _ = engine.send_exec(&mut bus);
        let rstack = Control::new(FrameKind::RstAck, false, false);
        let mut wire = [0u8; 16];
        let len = encode_frame(rstack, SeqByte::default(), &[2, 0, 0], &mut wire).unwrap();
        for &b in &wire[..len] {
            engine.receive(b).unwrap();
        }
        assert!(engine.is_connected());
    }

    #[test]
    fn handshake_reaches_connected_state() {
        let clock = TestClock::new();
        let mut engine: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock, LinkProfile::ncp_rtscts_115200());
        connect(&mut engine);
    }

    #[test]
    fn sent_payload_is_retired_once_acked() {
        let clock = TestClock::new();
        let mut engine: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock.clone(), LinkProfile::ncp_rtscts_115200());
        connect(&mut engine);

        engine.send(&[1, 2, 3]).unwrap();
        let mut bus = Loopback::new();
        engine.send_exec(&mut bus).unwrap();
        assert_eq!(engine.retransmit_queue.length(), 1);

        let ack = Control::new(FrameKind::Ack, false, false);
        let mut wire = [0u8; 16];
        let len = encode_frame(ack, SeqByte { frm: 0, ack: 1 }, &[], &mut wire).unwrap();
        for &b in &wire[..len] {
            engine.receive(b).unwrap();
        }
        assert!(engine.retransmit_queue.is_empty());
    }

    #[test]
    fn data_frame_round_trip_delivers_payload() {
        let clock = TestClock::new();
        let mut sender: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock.clone(), LinkProfile::ncp_rtscts_115200());
        connect(&mut sender);

        sender.send(&[9, 8, 7]).unwrap();
        let mut bus = Loopback::new();
        sender.send_exec(&mut bus).unwrap();

        let mut receiver: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock, LinkProfile::ncp_rtscts_115200());
        connect(&mut receiver);
        let mut got_payload = false;
        for &b in &bus.bytes {
            if let Ok(Some(_)) = receiver.receive(b) {
                got_payload = true;
            }
        }
        assert!(got_payload);
        let mut out = [0u8; 16];
        let n = receiver.take_received(&mut out).unwrap();
        assert_eq!(&out[..n], &[9, 8, 7]);
    }

    #[test]
    fn nak_marks_the_whole_outstanding_window_for_retransmit() {
        let clock = TestClock::new();
        let mut sender: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock, LinkProfile::ncp_rtscts_115200());
        connect(&mut sender);

        sender.send(&[1]).unwrap();
        sender.send(&[2]).unwrap();
        let mut bus = Loopback::new();
        sender.send_exec(&mut bus).unwrap();
        sender.send_exec(&mut bus).unwrap();
        assert_eq!(sender.retransmit_queue.length(), 2);

        let nak = Control::new(FrameKind::Nak, false, false);
        let mut wire = [0u8; 16];
        let len = encode_frame(nak, SeqByte { frm: 0, ack: 0 }, &[], &mut wire).unwrap();
        for &b in &wire[..len] {
            sender.receive(b).unwrap();
        }
        assert_eq!(sender.retransmit_queue.length(), 2);

        let mut resend_bus = Loopback::new();
        sender.send_exec(&mut resend_bus).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut first = None;
        for &b in &resend_bus.bytes {
            if let DecodeEvent::Frame(f) = decoder.process_byte(b) {
                first = Some(f);
            }
        }
        let first = first.unwrap();
        assert_eq!(first.control.kind, FrameKind::Data);
        assert!(first.control.retransmit);
        assert_eq!(first.seq.frm, 0);

        let mut resend_bus2 = Loopback::new();
        sender.send_exec(&mut resend_bus2).unwrap();
        let mut decoder2 = FrameDecoder::new();
        let mut second = None;
        for &b in &resend_bus2.bytes {
            if let DecodeEvent::Frame(f) = decoder2.process_byte(b) {
                second = Some(f);
            }
        }
        let second = second.unwrap();
        assert!(second.control.retransmit);
        assert_eq!(second.seq.frm, 1);
    }

    #[test]
    fn duplicate_data_frame_is_reacked_without_reenqueue() {
        let clock = TestClock::new();
        let mut receiver: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock, LinkProfile::ncp_rtscts_115200());
        connect(&mut receiver);

        let data = Control::new(FrameKind::Data, false, false);
        let mut wire = [0u8; 16];
        let len = encode_frame(data, SeqByte { frm: 0, ack: 0 }, &[5, 5], &mut wire).unwrap();
        for &b in &wire[..len] {
            receiver.receive(b).unwrap();
        }
        for &b in &wire[..len] {
            receiver.receive(b).unwrap();
        }

        assert_eq!(receiver.rx_queue.length(), 1);

        let mut bus = Loopback::new();
        receiver.send_exec(&mut bus).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut ack = None;
        for &b in &bus.bytes {
            if let DecodeEvent::Frame(f) = decoder.process_byte(b) {
                ack = Some(f);
            }
        }
        let ack = ack.unwrap();
        assert_eq!(ack.control.kind, FrameKind::Ack);
        assert_eq!(ack.seq.ack, 1);

        let mut out = [0u8; 16];
        assert!(receiver.take_received(&mut out).is_some());
        assert!(receiver.take_received(&mut out).is_none());
    }

    #[test]
    fn ack_feeds_observed_rtt_into_adaptive_timer() {
        let clock = TestClock::new();
        let mut sender: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock.clone(), LinkProfile::ncp_rtscts_115200());
        connect(&mut sender);
        let initial_period = sender.ack_period();
        assert_eq!(initial_period, Duration::from_millis(1600));

        sender.send(&[1]).unwrap();
        let mut bus = Loopback::new();
        sender.send_exec(&mut bus).unwrap();

        clock.advance(200);
        let ack = Control::new(FrameKind::Ack, false, false);
        let mut wire = [0u8; 16];
        let len = encode_frame(ack, SeqByte { frm: 0, ack: 1 }, &[], &mut wire).unwrap();
        for &b in &wire[..len] {
            sender.receive(b).unwrap();
        }

        // (7*1600 + 200) / 8 = 1425
        assert_eq!(sender.ack_period(), Duration::from_millis(1425));
    }

    #[test]
    fn not_ready_asserts_at_low_water_and_clears_at_high_water() {
        let clock = TestClock::new();
        let mut receiver: LinkEngine<9, 4, TestClock> =
            LinkEngine::new(clock, LinkProfile::ncp_rtscts_115200());
        connect(&mut receiver);
        assert!(!receiver.is_local_not_ready());

        let data = Control::new(FrameKind::Data, false, false);
        for frm in 0..2u8 {
            let mut wire = [0u8; 16];
            let len = encode_frame(data, SeqByte { frm, ack: 0 }, &[1], &mut wire).unwrap();
            for &b in &wire[..len] {
                receiver.receive(b).unwrap();
            }
        }
        // 4-slot pool, two buffers consumed: available() == 2 == nr_low_water.
        assert!(receiver.is_local_not_ready());

        let mut out = [0u8; 16];
        receiver.take_received(&mut out).unwrap();
        assert!(receiver.is_local_not_ready());
        receiver.take_received(&mut out).unwrap();
        // available() back to 4 == nr_high_water.
        assert!(!receiver.is_local_not_ready());
    }

    #[test]
    fn rst_ack_timeout_budget_latches_local_fatal_reason() {
        let clock = TestClock::new();
        let mut profile = LinkProfile::ncp_rtscts_115200();
        profile.max_timeouts = 1;
        profile.rst_ack_timeout = Duration::from_millis(10);
        let mut engine: LinkEngine<9, 4, TestClock> = LinkEngine::new(clock.clone(), profile);
        let mut ctrl = NoopControl;
        engine.start(&mut ctrl);

        clock.advance(20);
        engine.tick(&mut ctrl);

        assert_eq!(engine.state(), LinkState::Failed);
        assert_eq!(engine.last_local_fatal(), Some(SessionFatalLocal::RstAckTimeout));
    }

    #[test]
    fn retransmit_budget_exceeded_latches_local_fatal_reason() {
        let clock = TestClock::new();
        let mut profile = LinkProfile::ncp_rtscts_115200();
        profile.max_timeouts = 1;
        let mut sender: LinkEngine<9, 4, TestClock> = LinkEngine::new(clock.clone(), profile);
        connect(&mut sender);

        sender.send(&[1]).unwrap();
        let mut bus = Loopback::new();
        sender.send_exec(&mut bus).unwrap();

        let mut ctrl = NoopControl;
        clock.advance(sender.ack_period().as_millis() as u64 + 1);
        sender.tick(&mut ctrl);

        assert_eq!(sender.state(), LinkState::Failed);
        assert_eq!(
            sender.last_local_fatal(),
            Some(SessionFatalLocal::MaxRetransmissionsExceeded)
        );
    }
}
