//! Connection lifecycle state machine.
//!
//! ```text
//! DISCONNECTED --connect()-->   CONNECTING    (tx CONN)
//! CONNECTING   --rx CONN_ACK--> CONNECTED     (heartbeats start)
//! CONNECTING   --timeout------> DISCONNECTED
//! DISCONNECTED --rx CONN------> DISCONNECTED  (request surfaced; accept()
//!                                              answers CONN_ACK -> CONNECTED)
//! CONNECTED    --disconnect()-> DISCONNECTING (tx DISC)
//! DISCONNECTING--rx DISC_ACK--> DISCONNECTED
//! DISCONNECTING--timeout------> DISCONNECTED  (forced)
//! CONNECTED    --rx DISC------> DISCONNECTED  (tx DISC_ACK, 100ms linger)
//! CONNECTED    --hb timeout---> DISCONNECTED
//! ```
//!
//! The machine is pure state: methods take the current instant and return
//! actions for the coordinator to perform, so every transition is unit
//! testable without a clock or a wire.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::link::{Config, DisconnectReason, FrameType};

/// How long the passive side lingers after answering DISC with DISC_ACK,
/// giving the reply a chance to reach the wire before state is torn down.
const DISC_ACK_LINGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the coordinator must do after feeding the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAction {
    /// Emit a control frame of this type.
    Send(FrameType),
    /// The link just entered CONNECTED.
    Established,
    /// The link just entered DISCONNECTED; run the teardown.
    Dropped(DisconnectReason),
    /// An inbound CONN is waiting for an `accept` decision.
    Request { remote_seq: u8 },
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: LinkState,
    state_since: Instant,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    last_hb_sent: Instant,
    last_hb_recv: Instant,
    /// Remote seq of an unanswered inbound CONN.
    pending_request: Option<u8>,
    /// Set on the passive-close path; fires the delayed drop.
    teardown_at: Option<Instant>,
    local_seq: u8,
    remote_seq: u8,
}

impl ConnectionManager {
    pub fn new(config: &Config, now: Instant) -> Self {
        ConnectionManager {
            state: LinkState::Disconnected,
            state_since: now,
            connect_timeout: config.connect_timeout,
            disconnect_timeout: config.disconnect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            liveness_timeout: config.liveness_timeout(),
            last_hb_sent: now,
            last_hb_recv: now,
            pending_request: None,
            teardown_at: None,
            local_seq: 0,
            remote_seq: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn local_seq(&self) -> u8 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u8 {
        self.remote_seq
    }

    fn change_state(&mut self, new_state: LinkState, now: Instant) {
        if self.state != new_state {
            debug!("link state {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
            self.state_since = now;
        }
    }

    fn enter_connected(&mut self, now: Instant) {
        self.change_state(LinkState::Connected, now);
        self.last_hb_sent = now;
        self.last_hb_recv = now;
        self.pending_request = None;
        self.teardown_at = None;
    }

    fn enter_disconnected(&mut self, now: Instant) {
        self.change_state(LinkState::Disconnected, now);
        self.pending_request = None;
        self.teardown_at = None;
    }

    /// Active open. The caller guarantees the link is disconnected.
    pub fn start_connect(&mut self, now: Instant) -> Vec<ConnAction> {
        debug_assert_eq!(self.state, LinkState::Disconnected);
        self.change_state(LinkState::Connecting, now);
        vec![ConnAction::Send(FrameType::Conn)]
    }

    /// Answers a surfaced connection request. Returns `None` when there is
    /// no matching request outstanding.
    pub fn accept(&mut self, remote_seq: u8, now: Instant) -> Option<Vec<ConnAction>> {
        if self.state != LinkState::Disconnected || self.pending_request != Some(remote_seq) {
            return None;
        }
        self.remote_seq = remote_seq;
        self.enter_connected(now);
        Some(vec![
            ConnAction::Send(FrameType::ConnAck),
            ConnAction::Established,
        ])
    }

    /// Abandons a half-open connection attempt without a DISC exchange.
    pub fn abort(&mut self, now: Instant) -> Vec<ConnAction> {
        if self.state == LinkState::Disconnected {
            return Vec::new();
        }
        self.enter_disconnected(now);
        vec![ConnAction::Dropped(DisconnectReason::Local)]
    }

    /// Active close. The caller guarantees the link is connected.
    pub fn start_disconnect(&mut self, now: Instant) -> Vec<ConnAction> {
        debug_assert_eq!(self.state, LinkState::Connected);
        self.change_state(LinkState::Disconnecting, now);
        vec![ConnAction::Send(FrameType::Disc)]
    }

    /// Routes an inbound connection-control frame.
    pub fn on_frame(&mut self, frame_type: FrameType, seq: u8, now: Instant) -> Vec<ConnAction> {
        match frame_type {
            FrameType::Conn => {
                if self.state == LinkState::Disconnected {
                    self.pending_request = Some(seq);
                    vec![ConnAction::Request { remote_seq: seq }]
                } else {
                    warn!("CONN received in {:?}, ignored", self.state);
                    Vec::new()
                }
            }
            FrameType::ConnAck => {
                if self.state == LinkState::Connecting {
                    self.remote_seq = seq;
                    self.enter_connected(now);
                    vec![ConnAction::Established]
                } else {
                    warn!("CONN_ACK received in {:?}, ignored", self.state);
                    Vec::new()
                }
            }
            FrameType::Disc => match self.state {
                LinkState::Connected => {
                    // Reply, then drop once the DISC_ACK has had a moment to
                    // reach the wire.
                    self.change_state(LinkState::Disconnecting, now);
                    self.teardown_at = Some(now + DISC_ACK_LINGER);
                    vec![ConnAction::Send(FrameType::DiscAck)]
                }
                LinkState::Disconnecting => {
                    // Simultaneous close: answer and keep the earlier deadline.
                    if self.teardown_at.is_none() {
                        self.teardown_at = Some(now + DISC_ACK_LINGER);
                    }
                    vec![ConnAction::Send(FrameType::DiscAck)]
                }
                _ => {
                    debug!("DISC received in {:?}, ignored", self.state);
                    Vec::new()
                }
            },
            FrameType::DiscAck => {
                if self.state == LinkState::Disconnecting && self.teardown_at.is_none() {
                    self.enter_disconnected(now);
                    vec![ConnAction::Dropped(DisconnectReason::Local)]
                } else {
                    debug!("DISC_ACK received in {:?}, ignored", self.state);
                    Vec::new()
                }
            }
            FrameType::Heartbeat => {
                if self.state != LinkState::Connected {
                    return Vec::new();
                }
                self.last_hb_recv = now;
                // Echo, unless a heartbeat already went out this interval;
                // two peers echoing each other's echoes would flood the wire.
                if now.duration_since(self.last_hb_sent) >= self.heartbeat_interval {
                    self.last_hb_sent = now;
                    vec![ConnAction::Send(FrameType::Heartbeat)]
                } else {
                    Vec::new()
                }
            }
            FrameType::Data | FrameType::Ack | FrameType::Nak => {
                debug_assert!(false, "non-control frame routed to connection manager");
                Vec::new()
            }
        }
    }

    /// Drives every time-based transition.
    pub fn on_tick(&mut self, now: Instant) -> Vec<ConnAction> {
        match self.state {
            LinkState::Connecting => {
                if now.duration_since(self.state_since) >= self.connect_timeout {
                    warn!("connection request unanswered, giving up");
                    self.enter_disconnected(now);
                    return vec![ConnAction::Dropped(DisconnectReason::ConnectTimeout)];
                }
            }
            LinkState::Disconnecting => {
                if let Some(teardown_at) = self.teardown_at {
                    if now >= teardown_at {
                        self.enter_disconnected(now);
                        return vec![ConnAction::Dropped(DisconnectReason::Remote)];
                    }
                } else if now.duration_since(self.state_since) >= self.disconnect_timeout {
                    warn!("DISC_ACK never arrived, forcing teardown");
                    self.enter_disconnected(now);
                    return vec![ConnAction::Dropped(DisconnectReason::DisconnectTimeout)];
                }
            }
            LinkState::Connected => {
                if now.duration_since(self.last_hb_recv) > self.liveness_timeout {
                    warn!(
                        "no heartbeat for {}ms, peer presumed dead",
                        now.duration_since(self.last_hb_recv).as_millis()
                    );
                    self.enter_disconnected(now);
                    return vec![ConnAction::Dropped(DisconnectReason::HeartbeatTimeout)];
                }
                if now.duration_since(self.last_hb_sent) >= self.heartbeat_interval {
                    self.last_hb_sent = now;
                    return vec![ConnAction::Send(FrameType::Heartbeat)];
                }
            }
            LinkState::Disconnected => {}
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            heartbeat_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(1000),
            disconnect_timeout: Duration::from_millis(800),
            ..Config::default()
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn active_handshake() {
        let t0 = Instant::now();
        let mut conn = ConnectionManager::new(&config(), t0);

        let actions = conn.start_connect(t0);
        assert_eq!(actions, vec![ConnAction::Send(FrameType::Conn)]);
        assert_eq!(conn.state(), LinkState::Connecting);

        let actions = conn.on_frame(FrameType::ConnAck, 0, t0 + ms(20));
        assert_eq!(actions, vec![ConnAction::Established]);
        assert_eq!(conn.state(), LinkState::Connected);
    }

    #[test]
    fn passive_handshake_requires_accept() {
        let t0 = Instant::now();
        let mut conn = ConnectionManager::new(&config(), t0);

        let actions = conn.on_frame(FrameType::Conn, 0, t0);
        assert_eq!(actions, vec![ConnAction::Request { remote_seq: 0 }]);
        assert_eq!(conn.state(), LinkState::Disconnected);

        assert!(conn.accept(5, t0 + ms(1)).is_none());

        let actions = conn.accept(0, t0 + ms(2)).unwrap();
        assert_eq!(
            actions,
            vec![
                ConnAction::Send(FrameType::ConnAck),
                ConnAction::Established
            ]
        );
        assert_eq!(conn.state(), LinkState::Connected);
    }

    #[test]
    fn connect_times_out() {
        let t0 = Instant::now();
        let mut conn = ConnectionManager::new(&config(), t0);
        conn.start_connect(t0);

        assert!(conn.on_tick(t0 + ms(999)).is_empty());
        let actions = conn.on_tick(t0 + ms(1000));
        assert_eq!(
            actions,
            vec![ConnAction::Dropped(DisconnectReason::ConnectTimeout)]
        );
        assert_eq!(conn.state(), LinkState::Disconnected);
    }

    #[test]
    fn graceful_disconnect() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        let actions = conn.start_disconnect(t0 + ms(10));
        assert_eq!(actions, vec![ConnAction::Send(FrameType::Disc)]);

        let actions = conn.on_frame(FrameType::DiscAck, 0, t0 + ms(20));
        assert_eq!(actions, vec![ConnAction::Dropped(DisconnectReason::Local)]);
        assert_eq!(conn.state(), LinkState::Disconnected);
    }

    #[test]
    fn disconnect_is_forced_without_disc_ack() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        conn.start_disconnect(t0);

        assert!(conn.on_tick(t0 + ms(799)).is_empty());
        let actions = conn.on_tick(t0 + ms(800));
        assert_eq!(
            actions,
            vec![ConnAction::Dropped(DisconnectReason::DisconnectTimeout)]
        );
    }

    #[test]
    fn remote_disc_answers_then_lingers() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        let actions = conn.on_frame(FrameType::Disc, 0, t0 + ms(10));
        assert_eq!(actions, vec![ConnAction::Send(FrameType::DiscAck)]);
        assert_eq!(conn.state(), LinkState::Disconnecting);

        assert!(conn.on_tick(t0 + ms(50)).is_empty());
        let actions = conn.on_tick(t0 + ms(120));
        assert_eq!(actions, vec![ConnAction::Dropped(DisconnectReason::Remote)]);
    }

    #[test]
    fn heartbeats_are_periodic_and_liveness_drops_the_link() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        assert!(conn.on_tick(t0 + ms(499)).is_empty());
        assert_eq!(
            conn.on_tick(t0 + ms(500)),
            vec![ConnAction::Send(FrameType::Heartbeat)]
        );

        // Peer heartbeats keep the link alive.
        conn.on_frame(FrameType::Heartbeat, 0, t0 + ms(600));
        assert_eq!(
            conn.on_tick(t0 + ms(2000)),
            vec![ConnAction::Send(FrameType::Heartbeat)]
        );

        // Silence for three intervals kills it (measured from the last
        // heartbeat the peer sent at t0+600).
        let actions = conn.on_tick(t0 + ms(600) + ms(1501));
        assert_eq!(
            actions,
            vec![ConnAction::Dropped(DisconnectReason::HeartbeatTimeout)]
        );
    }

    #[test]
    fn heartbeat_echo_is_rate_limited() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        // Just heartbeated ourselves; the echo is suppressed.
        assert_eq!(
            conn.on_tick(t0 + ms(500)),
            vec![ConnAction::Send(FrameType::Heartbeat)]
        );
        assert!(conn.on_frame(FrameType::Heartbeat, 0, t0 + ms(510)).is_empty());

        // A heartbeat arriving a full interval later is echoed.
        let actions = conn.on_frame(FrameType::Heartbeat, 0, t0 + ms(1100));
        assert_eq!(actions, vec![ConnAction::Send(FrameType::Heartbeat)]);
    }

    fn connected(t0: Instant) -> ConnectionManager {
        let mut conn = ConnectionManager::new(&config(), t0);
        conn.start_connect(t0);
        conn.on_frame(FrameType::ConnAck, 0, t0);
        assert_eq!(conn.state(), LinkState::Connected);
        conn
    }
}
