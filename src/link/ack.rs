//! Outstanding-frame tracking and retransmission deadlines.
//!
//! Every DATA frame handed to the physical layer is registered here with a
//! copy of its encoded bytes and a deadline. The engine tick scans the
//! deadlines; an entry whose deadline fires is either retransmitted (and
//! re-armed) or, once its retries are spent, dropped and reported. A
//! deadline lives exactly as long as its entry, so timers and state can
//! never drift apart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

#[derive(Debug)]
struct PendingAck {
    frame: Vec<u8>,
    sent_at: Instant,
    deadline: Instant,
    retries: u8,
}

/// Round-trip data reported when a pending frame is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub rtt: Duration,
    pub retries: u8,
}

/// What a fired deadline asks the coordinator to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    Retransmit { seq: u8, frame: Vec<u8> },
    Failed { seq: u8, retries: u8 },
}

/// Reaction to an inbound NAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakAction {
    Retransmit { frame: Vec<u8> },
    Failed { retries: u8 },
    Unknown,
}

#[derive(Debug)]
pub struct AckEngine {
    timeout: Duration,
    max_retries: u8,
    pending: HashMap<u8, PendingAck>,
}

impl AckEngine {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        AckEngine {
            timeout,
            max_retries,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Tracks an encoded DATA frame just handed to the physical layer. An
    /// existing entry for the same seq (stale from a previous epoch) is
    /// replaced, deadline included.
    pub fn register(&mut self, seq: u8, frame: Vec<u8>, now: Instant) {
        if self.pending.contains_key(&seq) {
            warn!("replacing stale pending entry for seq {}", seq);
        }
        self.pending.insert(
            seq,
            PendingAck {
                frame,
                sent_at: now,
                deadline: now + self.timeout,
                retries: 0,
            },
        );
    }

    /// Clears the entry for an acknowledged seq. `None` means the ACK was
    /// spurious.
    pub fn on_ack(&mut self, seq: u8, now: Instant) -> Option<AckInfo> {
        let entry = self.pending.remove(&seq)?;
        let info = AckInfo {
            rtt: now.duration_since(entry.sent_at),
            retries: entry.retries,
        };
        trace!(
            "ack for seq {}: rtt={}ms, retries={}",
            seq,
            info.rtt.as_millis(),
            info.retries
        );
        Some(info)
    }

    /// Silently clears an entry covered by a cumulative ACK.
    pub fn sweep(&mut self, seq: u8) -> bool {
        if self.pending.remove(&seq).is_some() {
            trace!("cumulative ack swept seq {}", seq);
            true
        } else {
            false
        }
    }

    /// Immediate retransmission in response to a NAK. This spends a retry
    /// just like a timeout does, so NAK acceleration can still exhaust the
    /// frame later.
    pub fn on_nak(&mut self, seq: u8, now: Instant) -> NakAction {
        let Some(entry) = self.pending.get_mut(&seq) else {
            return NakAction::Unknown;
        };

        if entry.retries >= self.max_retries {
            let retries = entry.retries;
            self.pending.remove(&seq);
            return NakAction::Failed { retries };
        }

        entry.retries += 1;
        entry.deadline = now + self.timeout;
        debug!("nak for seq {}: retransmitting (retry {})", seq, entry.retries);
        NakAction::Retransmit {
            frame: entry.frame.clone(),
        }
    }

    /// Scans the deadlines. Each fired entry is retransmitted and re-armed,
    /// or removed once `max_retries` extra transmissions have already gone
    /// out.
    pub fn on_tick(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut fired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect();
        fired.sort_unstable();

        let mut actions = Vec::with_capacity(fired.len());
        for seq in fired {
            let entry = match self.pending.get_mut(&seq) {
                Some(entry) => entry,
                None => continue,
            };

            if entry.retries >= self.max_retries {
                let retries = entry.retries;
                self.pending.remove(&seq);
                debug!("seq {} exhausted after {} retries", seq, retries);
                actions.push(TimerAction::Failed { seq, retries });
            } else {
                entry.retries += 1;
                entry.deadline = now + self.timeout;
                debug!("seq {} timed out, retry {}", seq, entry.retries);
                actions.push(TimerAction::Retransmit {
                    seq,
                    frame: entry.frame.clone(),
                });
            }
        }
        actions
    }

    /// Drops every entry and its deadline; used on disconnect.
    pub fn clear_all(&mut self) {
        if !self.pending.is_empty() {
            debug!("clearing {} pending entries", self.pending.len());
        }
        self.pending.clear();
    }
}
