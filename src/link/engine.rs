//! The coordinator: owns the window, the ACK engine, the connection state
//! machine, and the send queue, and routes every inbound frame.
//!
//! The engine is purely synchronous. Entry points take `now` explicitly and
//! queue outbound frames in an outbox instead of touching the wire, so the
//! whole protocol can be driven deterministically; the `DataLink` wrapper
//! supplies real time, flushes the outbox to the transmit hook, and adds the
//! blocking API on top.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

use crate::link::ack::{AckEngine, NakAction, TimerAction};
use crate::link::conn::{ConnAction, ConnectionManager};
use crate::link::frame::{Frame, FrameError};
use crate::link::window::{AckOutcome, RecvOutcome, Window};
use crate::link::{
    Config, DisconnectReason, Event, FrameErrorKind, FrameType, LinkState, Stats, MAX_DATA,
};
use crate::Error;

/// Fate of a queued `send`, picked up by the blocked caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStatus {
    /// Framed and handed to the physical layer.
    Dispatched,
    /// Flushed out of the queue by a disconnect.
    Rejected,
}

#[derive(Debug)]
struct QueuedSend {
    ticket: u64,
    payload: Vec<u8>,
}

pub(crate) struct Engine {
    config: Config,
    conn: ConnectionManager,
    window: Window,
    acks: AckEngine,
    send_queue: VecDeque<QueuedSend>,
    completed: HashMap<u64, SendStatus>,
    next_ticket: u64,
    outbox: Vec<Vec<u8>>,
    events: mpsc::Sender<Event>,
    stats: Stats,
    /// Deduplicates the WindowFull event while the pump is stalled.
    window_blocked: bool,
}

impl Engine {
    pub(crate) fn new(config: Config, events: mpsc::Sender<Event>, now: Instant) -> Self {
        Engine {
            conn: ConnectionManager::new(&config, now),
            window: Window::new(config.window_size),
            acks: AckEngine::new(config.ack_timeout, config.max_retries),
            send_queue: VecDeque::new(),
            completed: HashMap::new(),
            next_ticket: 0,
            outbox: Vec::new(),
            events,
            stats: Stats::default(),
            window_blocked: false,
            config,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.conn.state()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats.clone()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Puts undeliverable frames back at the head of the outbox, keeping
    /// their transmit order.
    pub(crate) fn requeue_outbox(&mut self, mut frames: Vec<Vec<u8>>) {
        frames.append(&mut self.outbox);
        self.outbox = frames;
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Network-layer API
    // ------------------------------------------------------------------

    pub(crate) fn start_connect(&mut self, now: Instant) -> Result<(), Error> {
        match self.state() {
            LinkState::Connected => Err(Error::AlreadyConnected),
            LinkState::Connecting | LinkState::Disconnecting => Err(Error::ConnectionInProgress),
            LinkState::Disconnected => {
                let actions = self.conn.start_connect(now);
                self.apply_conn_actions(actions);
                Ok(())
            }
        }
    }

    pub(crate) fn accept(&mut self, remote_seq: u8, now: Instant) -> bool {
        match self.conn.accept(remote_seq, now) {
            Some(actions) => {
                self.apply_conn_actions(actions);
                true
            }
            None => false,
        }
    }

    /// Starts a teardown. Returns whether the caller has to wait for the
    /// DISC_ACK round trip.
    pub(crate) fn start_disconnect(&mut self, now: Instant) -> bool {
        match self.state() {
            LinkState::Disconnected => false,
            LinkState::Disconnecting => true,
            LinkState::Connecting => {
                // Abandon the half-open attempt on the spot.
                let actions = self.conn.abort(now);
                self.apply_conn_actions(actions);
                false
            }
            LinkState::Connected => {
                let actions = self.conn.start_disconnect(now);
                self.apply_conn_actions(actions);
                true
            }
        }
    }

    /// Queues a payload for transmission and tries to dispatch it right
    /// away. The returned ticket resolves through [`Engine::take_status`].
    pub(crate) fn queue_send(&mut self, payload: Vec<u8>, now: Instant) -> Result<u64, Error> {
        if payload.len() > MAX_DATA {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        if self.state() != LinkState::Connected {
            return Err(Error::NotConnected);
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.send_queue.push_back(QueuedSend { ticket, payload });
        self.pump(now);
        Ok(ticket)
    }

    pub(crate) fn take_status(&mut self, ticket: u64) -> Option<SendStatus> {
        self.completed.remove(&ticket)
    }

    // ------------------------------------------------------------------
    // Physical-layer upcall
    // ------------------------------------------------------------------

    /// Dispatches one raw frame from the physical layer.
    pub(crate) fn on_rx(&mut self, bytes: &[u8], now: Instant) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(FrameError::CrcMismatch {
                expected,
                calculated,
            }) => {
                warn!(
                    "crc mismatch: frame {:#06x}, computed {:#06x}; dropped",
                    expected, calculated
                );
                self.stats.crc_errors += 1;
                self.emit(Event::FrameError {
                    kind: FrameErrorKind::Crc,
                });
                return;
            }
            Err(FrameError::Stuffing) => {
                trace!("stuffing violation; frame dropped");
                self.stats.stuffing_errors += 1;
                return;
            }
            Err(FrameError::UnknownType(byte)) => {
                warn!("unknown frame type {:#04x}; dropped", byte);
                self.stats.unknown_frames += 1;
                self.emit(Event::FrameError {
                    kind: FrameErrorKind::UnknownType,
                });
                return;
            }
            Err(err) => {
                trace!("malformed frame dropped: {}", err);
                self.stats.malformed_frames += 1;
                return;
            }
        };

        self.stats.frames_received += 1;
        trace!(
            "rx {:?} seq={} len={}",
            frame.frame_type,
            frame.seq,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Data => self.handle_data(frame, now),
            FrameType::Ack => self.handle_ack(frame.seq, now),
            FrameType::Nak => self.handle_nak(frame.seq, now),
            FrameType::Conn
            | FrameType::ConnAck
            | FrameType::Disc
            | FrameType::DiscAck
            | FrameType::Heartbeat => {
                if frame.frame_type == FrameType::Heartbeat
                    && self.state() == LinkState::Connected
                {
                    self.emit(Event::HeartbeatReceived);
                }
                let actions = self.conn.on_frame(frame.frame_type, frame.seq, now);
                self.apply_conn_actions(actions);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Periodic driver: connection timeouts and heartbeats, retransmission
    /// deadlines, then another pass over the send queue.
    pub(crate) fn on_tick(&mut self, now: Instant) {
        let actions = self.conn.on_tick(now);
        self.apply_conn_actions(actions);

        if self.state() == LinkState::Connected {
            for action in self.acks.on_tick(now) {
                match action {
                    TimerAction::Retransmit { seq, frame } => {
                        self.stats.retransmits += 1;
                        debug!("retransmitting seq {} after timeout", seq);
                        self.outbox.push(frame);
                    }
                    TimerAction::Failed { seq, retries } => {
                        self.stats.frames_failed += 1;
                        self.emit(Event::TransmissionFailed { seq, retries });
                    }
                }
            }
        }

        self.pump(now);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handle_data(&mut self, frame: Frame, now: Instant) {
        if self.state() != LinkState::Connected {
            debug!("DATA seq={} while {:?}; dropped", frame.seq, self.state());
            return;
        }

        match self.window.on_frame(frame.seq, frame.payload, now) {
            RecvOutcome::Delivered(frames) => {
                // All of them are covered by one cumulative ACK for the
                // highest seq.
                let last_seq = frames.last().map(|(seq, _)| *seq).unwrap_or(frame.seq);
                for (seq, bytes) in frames {
                    self.emit(Event::DataReceived { seq, bytes });
                }
                self.send_ack(last_seq);
            }
            RecvOutcome::Buffered => {
                self.emit(Event::FrameBuffered {
                    seq: frame.seq,
                    expected: self.window.expected_seq(),
                });
            }
            RecvOutcome::Duplicate => {
                // The earlier ACK may have been lost; repeat it.
                self.stats.duplicates_dropped += 1;
                self.send_ack(frame.seq);
            }
            RecvOutcome::OutOfWindow => {
                self.stats.out_of_window_dropped += 1;
            }
        }
    }

    fn handle_ack(&mut self, seq: u8, now: Instant) {
        let info = self.acks.on_ack(seq, now);

        match self.window.on_ack(seq) {
            AckOutcome::Advanced {
                acked,
                old_base,
                new_base,
            } => {
                // The cumulative ACK covers every seq up to and including
                // `seq`; their timers must go with them.
                for swept in acked {
                    if swept != seq {
                        self.acks.sweep(swept);
                    }
                }
                if let Some(info) = info {
                    debug!(
                        "ack seq={} rtt={}ms retries={}",
                        seq,
                        info.rtt.as_millis(),
                        info.retries
                    );
                    self.emit(Event::AckReceived { seq, rtt: info.rtt });
                    let loss_rate = self.loss_rate();
                    self.window.adjust(info.rtt, loss_rate);
                }
                self.emit(Event::WindowAdvanced { old_base, new_base });
                self.window_blocked = false;
                self.pump(now);
            }
            AckOutcome::Duplicate | AckOutcome::OutOfWindow => {
                self.stats.spurious_acks += 1;
                debug!("spurious ack seq={}", seq);
            }
        }
    }

    fn handle_nak(&mut self, seq: u8, now: Instant) {
        self.emit(Event::NakReceived { seq });
        match self.acks.on_nak(seq, now) {
            NakAction::Retransmit { frame } => {
                self.stats.retransmits += 1;
                self.outbox.push(frame);
            }
            NakAction::Failed { retries } => {
                self.stats.frames_failed += 1;
                self.emit(Event::TransmissionFailed { seq, retries });
            }
            NakAction::Unknown => {
                debug!("nak for unknown seq {}", seq);
            }
        }
    }

    /// Drains the send queue while the window and the connection allow.
    fn pump(&mut self, now: Instant) {
        while self.state() == LinkState::Connected && !self.send_queue.is_empty() {
            let Some(seq) = self.window.acquire_seq() else {
                if !self.window_blocked {
                    self.window_blocked = true;
                    self.emit(Event::WindowFull);
                }
                break;
            };

            let Some(item) = self.send_queue.pop_front() else {
                break;
            };
            let size = item.payload.len();
            match Frame::new(FrameType::Data, seq, item.payload).encode() {
                Ok(wire) => {
                    self.acks.register(seq, wire.clone(), now);
                    self.outbox.push(wire);
                    self.stats.frames_sent += 1;
                    self.emit(Event::DataFrameSent { seq, size });
                    self.completed.insert(item.ticket, SendStatus::Dispatched);
                }
                Err(err) => {
                    // Length is validated at queue time; this cannot fire.
                    warn!("dropping unencodable queued payload: {}", err);
                    self.completed.insert(item.ticket, SendStatus::Rejected);
                }
            }
        }
    }

    fn loss_rate(&self) -> f64 {
        let total = self.stats.frames_sent + self.stats.retransmits;
        if total == 0 {
            0.0
        } else {
            self.stats.retransmits as f64 / total as f64
        }
    }

    fn send_ack(&mut self, seq: u8) {
        self.push_control(FrameType::Ack, seq, Vec::new());
        self.emit(Event::AckSent { seq });
    }

    fn apply_conn_actions(&mut self, actions: Vec<ConnAction>) {
        for action in actions {
            match action {
                ConnAction::Send(frame_type) => self.push_conn_frame(frame_type),
                ConnAction::Established => {
                    self.emit(Event::Connected);
                }
                ConnAction::Dropped(reason) => self.teardown(reason),
                ConnAction::Request { remote_seq } => {
                    self.emit(Event::ConnectionRequest { remote_seq });
                }
            }
        }
    }

    /// Control-frame payloads are informative only; the peer keys off the
    /// type byte.
    fn push_conn_frame(&mut self, frame_type: FrameType) {
        let (seq, payload): (u8, Vec<u8>) = match frame_type {
            FrameType::Conn => (self.conn.local_seq(), b"CONNECT_REQUEST".to_vec()),
            FrameType::ConnAck => (self.conn.remote_seq(), b"CONNECT_ACK".to_vec()),
            FrameType::Disc => (0, b"DISCONNECT".to_vec()),
            FrameType::DiscAck => (0, b"DISCONNECT_ACK".to_vec()),
            FrameType::Heartbeat => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                (0, millis.to_string().into_bytes())
            }
            FrameType::Data | FrameType::Ack | FrameType::Nak => {
                debug_assert!(false, "not a connection-control frame");
                return;
            }
        };

        self.push_control(frame_type, seq, payload);
        if frame_type == FrameType::Heartbeat {
            self.emit(Event::HeartbeatSent);
        }
    }

    fn push_control(&mut self, frame_type: FrameType, seq: u8, payload: Vec<u8>) {
        match Frame::new(frame_type, seq, payload).encode() {
            Ok(wire) => self.outbox.push(wire),
            Err(err) => warn!("failed to encode {:?} frame: {}", frame_type, err),
        }
    }

    /// Runs the full teardown contract: cancel every retransmission timer,
    /// reject what is still queued, rewind the window, and tell the
    /// subscriber why.
    fn teardown(&mut self, reason: DisconnectReason) {
        debug!("teardown: {:?}", reason);
        self.acks.clear_all();
        while let Some(item) = self.send_queue.pop_front() {
            self.completed.insert(item.ticket, SendStatus::Rejected);
        }
        self.window.reset();
        self.window_blocked = false;
        self.emit(Event::Disconnected { reason });
    }
}
