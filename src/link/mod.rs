use std::time::Duration;

mod ack;
mod conn;
mod engine;
pub mod frame;
mod window;

pub use conn::LinkState;
pub(crate) use engine::{Engine, SendStatus};

/// Number of distinct sequence numbers on the wire (4-bit field).
pub const SEQ_MOD: u8 = 16;
/// Largest payload a single DATA frame can carry.
pub const MAX_DATA: usize = 1024;
/// Upper bound on the sliding window; half the sequence space, so the
/// sender and receiver windows can never overlap across a wrap.
pub const MAX_WINDOW: u8 = SEQ_MOD / 2;

/// Control byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ack,
    Nak,
    Conn,
    ConnAck,
    Disc,
    DiscAck,
    Heartbeat,
}

impl FrameType {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => 0x01,
            FrameType::Ack => 0x02,
            FrameType::Nak => 0x03,
            FrameType::Conn => 0x04,
            FrameType::ConnAck => 0x05,
            FrameType::Disc => 0x06,
            FrameType::DiscAck => 0x07,
            FrameType::Heartbeat => 0x08,
        }
    }

    pub fn from_byte(byte: u8) -> Option<FrameType> {
        match byte {
            0x01 => Some(FrameType::Data),
            0x02 => Some(FrameType::Ack),
            0x03 => Some(FrameType::Nak),
            0x04 => Some(FrameType::Conn),
            0x05 => Some(FrameType::ConnAck),
            0x06 => Some(FrameType::Disc),
            0x07 => Some(FrameType::DiscAck),
            0x08 => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

/// Tunable protocol parameters. The defaults match the protocol constants;
/// tests shrink the timeouts to keep the suite fast.
#[derive(Debug, Clone)]
pub struct Config {
    /// Outstanding-frame limit, clamped to `1..=MAX_WINDOW`.
    pub window_size: u8,
    /// How long a DATA frame may stay unacknowledged before retransmission.
    pub ack_timeout: Duration,
    /// Retransmissions attempted before a frame is declared failed.
    pub max_retries: u8,
    /// Period of the liveness probe while connected.
    pub heartbeat_interval: Duration,
    /// How long a CONN may stay unanswered before `connect` fails.
    pub connect_timeout: Duration,
    /// How long to wait for DISC_ACK before forcing the local teardown.
    pub disconnect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_size: 8,
            ack_timeout: Duration::from_millis(2000),
            max_retries: 3,
            heartbeat_interval: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(10000),
            disconnect_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    /// The peer is declared dead after three silent heartbeat periods.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Why the link left the CONNECTED (or CONNECTING) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local `disconnect` completed (DISC_ACK received).
    Local,
    /// The peer sent DISC.
    Remote,
    /// No heartbeat from the peer within three intervals.
    HeartbeatTimeout,
    /// CONN went unanswered.
    ConnectTimeout,
    /// DISC_ACK never arrived; teardown was forced.
    DisconnectTimeout,
}

/// Why a dropped inbound frame was surfaced as an event. Structural damage
/// (missing flags, truncation, bad escapes) is only counted: there is no seq
/// worth reporting against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorKind {
    /// Checksum mismatch over an otherwise well-formed frame.
    Crc,
    /// Control byte outside the known set.
    UnknownType,
}

/// Everything the engine reports upward. A single subscriber drains these;
/// `DataReceived` is the in-order delivery upcall to the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnected { reason: DisconnectReason },
    /// A CONN arrived while disconnected; the caller may `accept` it.
    ConnectionRequest { remote_seq: u8 },
    DataReceived { seq: u8, bytes: Vec<u8> },
    DataFrameSent { seq: u8, size: usize },
    WindowAdvanced { old_base: u8, new_base: u8 },
    WindowFull,
    FrameBuffered { seq: u8, expected: u8 },
    FrameError { kind: FrameErrorKind },
    AckSent { seq: u8 },
    AckReceived { seq: u8, rtt: Duration },
    NakReceived { seq: u8 },
    /// A frame exhausted its retries and was dropped from the pending set.
    TransmissionFailed { seq: u8, retries: u8 },
    HeartbeatSent,
    HeartbeatReceived,
}

/// Cumulative counters, readable at any time through `DataLink::stats`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// DATA frames handed to the physical layer, first transmissions only.
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub crc_errors: u64,
    pub stuffing_errors: u64,
    pub malformed_frames: u64,
    pub unknown_frames: u64,
    pub spurious_acks: u64,
    pub duplicates_dropped: u64,
    pub out_of_window_dropped: u64,
    pub frames_failed: u64,
}
