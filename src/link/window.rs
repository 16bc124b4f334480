//! Sliding-window bookkeeping over the modulo-16 sequence space.
//!
//! One `Window` carries both directions of a peer: the sender side
//! (`send_base`/`next_seq`) bounds how many DATA frames may be outstanding,
//! the receiver side (`expected_seq` plus a 16-slot buffer) reorders inbound
//! frames and releases them strictly in sequence.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::link::{MAX_WINDOW, SEQ_MOD};

/// `(a - b) mod 16`, always in `0..16`.
pub fn seq_diff(a: u8, b: u8) -> u8 {
    (a.wrapping_sub(b).wrapping_add(SEQ_MOD)) % SEQ_MOD
}

/// Like [`seq_diff`] but folds distances past the half-space into the
/// negative range, distinguishing "ahead of" from "behind".
pub fn seq_diff_signed(a: u8, b: u8) -> i8 {
    let d = seq_diff(a, b);
    if d > SEQ_MOD / 2 {
        d as i8 - SEQ_MOD as i8
    } else {
        d as i8
    }
}

/// Outcome of feeding an ACK to the sender side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Behind the window base; the frame was already acknowledged.
    Duplicate,
    /// Ahead of anything outstanding; ignored.
    OutOfWindow,
    /// The window slid. `acked` holds every sequence number the cumulative
    /// ACK covered, oldest first, so the caller can clear their timers.
    Advanced {
        acked: Vec<u8>,
        old_base: u8,
        new_base: u8,
    },
}

/// Outcome of feeding a DATA frame to the receiver side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The frame (and possibly buffered successors) are deliverable in order.
    Delivered(Vec<(u8, Vec<u8>)>),
    /// In-window but ahead of `expected_seq`; held back, not acknowledged.
    Buffered,
    /// Already delivered in this epoch; the caller re-acknowledges it.
    Duplicate,
    /// Outside the receive window entirely; dropped.
    OutOfWindow,
}

#[derive(Debug)]
struct ReceiveSlot {
    payload: Vec<u8>,
    received_at: Instant,
}

#[derive(Debug)]
pub struct Window {
    window_size: u8,
    send_base: u8,
    next_seq: u8,
    expected_seq: u8,
    slots: [Option<ReceiveSlot>; SEQ_MOD as usize],
}

impl Window {
    pub fn new(window_size: u8) -> Self {
        Window {
            window_size: window_size.clamp(1, MAX_WINDOW),
            send_base: 0,
            next_seq: 0,
            expected_seq: 0,
            slots: Default::default(),
        }
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    pub fn send_base(&self) -> u8 {
        self.send_base
    }

    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    pub fn expected_seq(&self) -> u8 {
        self.expected_seq
    }

    /// How many DATA frames are in flight.
    pub fn outstanding(&self) -> u8 {
        seq_diff(self.next_seq, self.send_base)
    }

    pub fn can_send(&self) -> bool {
        self.outstanding() < self.window_size
    }

    /// Hands out the next sequence number, or `None` while the window is
    /// full.
    pub fn acquire_seq(&mut self) -> Option<u8> {
        if !self.can_send() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq = (self.next_seq + 1) % SEQ_MOD;
        Some(seq)
    }

    /// Applies a cumulative ACK. An ACK for `k` acknowledges everything in
    /// `send_base..=k`.
    pub fn on_ack(&mut self, ack_seq: u8) -> AckOutcome {
        let ack_seq = ack_seq % SEQ_MOD;
        let d = seq_diff(ack_seq, self.send_base);

        if seq_diff_signed(ack_seq, self.send_base) < 0 {
            trace!("duplicate ack {} behind base {}", ack_seq, self.send_base);
            return AckOutcome::Duplicate;
        }
        if d >= self.outstanding() {
            trace!(
                "ack {} beyond outstanding [{}, {})",
                ack_seq,
                self.send_base,
                self.next_seq
            );
            return AckOutcome::OutOfWindow;
        }

        let old_base = self.send_base;
        let mut acked = Vec::with_capacity(d as usize + 1);
        let mut seq = self.send_base;
        loop {
            acked.push(seq);
            if seq == ack_seq {
                break;
            }
            seq = (seq + 1) % SEQ_MOD;
        }
        self.send_base = (ack_seq + 1) % SEQ_MOD;
        debug!(
            "window slid {} -> {} ({} acked)",
            old_base,
            self.send_base,
            acked.len()
        );
        AckOutcome::Advanced {
            acked,
            old_base,
            new_base: self.send_base,
        }
    }

    /// Accepts an inbound DATA frame and drains every in-order payload it
    /// unblocks.
    pub fn on_frame(&mut self, seq: u8, payload: Vec<u8>, now: Instant) -> RecvOutcome {
        let seq = seq % SEQ_MOD;
        let d = seq_diff(seq, self.expected_seq);

        if seq_diff_signed(seq, self.expected_seq) < 0 {
            return RecvOutcome::Duplicate;
        }
        if d >= self.window_size {
            return RecvOutcome::OutOfWindow;
        }

        self.slots[seq as usize] = Some(ReceiveSlot {
            payload,
            received_at: now,
        });

        if d != 0 {
            return RecvOutcome::Buffered;
        }

        let mut delivered = Vec::new();
        while let Some(slot) = self.slots[self.expected_seq as usize].take() {
            trace!(
                "delivering seq {} (buffered {}ms)",
                self.expected_seq,
                now.duration_since(slot.received_at).as_millis()
            );
            delivered.push((self.expected_seq, slot.payload));
            self.expected_seq = (self.expected_seq + 1) % SEQ_MOD;
        }
        RecvOutcome::Delivered(delivered)
    }

    /// Advisory resize from the coordinator's RTT/loss estimates.
    pub fn adjust(&mut self, rtt: Duration, loss_rate: f64) {
        let before = self.window_size;
        if loss_rate > 0.05 {
            self.window_size = (self.window_size / 2).max(1);
        } else if loss_rate > 0.01 {
            self.window_size = (self.window_size - 1).max(1);
        } else if rtt < Duration::from_millis(100) && loss_rate < 0.001 {
            self.window_size = (self.window_size + 1).min(MAX_WINDOW);
        }
        if self.window_size != before {
            debug!(
                "window hint: size {} -> {} (rtt={}ms, loss={:.3})",
                before,
                self.window_size,
                rtt.as_millis(),
                loss_rate
            );
        }
    }

    /// Returns both directions to the initial epoch.
    pub fn reset(&mut self) {
        self.send_base = 0;
        self.next_seq = 0;
        self.expected_seq = 0;
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn seq_diff_wraps() {
        assert_eq!(seq_diff(3, 1), 2);
        assert_eq!(seq_diff(1, 15), 2);
        assert_eq!(seq_diff(0, 0), 0);
        assert_eq!(seq_diff_signed(15, 1), -2);
        assert_eq!(seq_diff_signed(1, 15), 2);
        assert_eq!(seq_diff_signed(9, 1), 8);
    }

    #[test]
    fn window_bound_holds() {
        let mut w = Window::new(8);
        for expected in 0..8 {
            assert!(w.can_send());
            assert_eq!(w.acquire_seq(), Some(expected));
            assert!(w.outstanding() <= w.window_size());
        }
        assert!(!w.can_send());
        assert_eq!(w.acquire_seq(), None);
        assert_eq!(w.outstanding(), 8);
    }

    #[test]
    fn cumulative_ack_slides_and_reports_every_seq() {
        let mut w = Window::new(8);
        for _ in 0..5 {
            w.acquire_seq();
        }

        match w.on_ack(2) {
            AckOutcome::Advanced {
                acked,
                old_base,
                new_base,
            } => {
                assert_eq!(acked, vec![0, 1, 2]);
                assert_eq!(old_base, 0);
                assert_eq!(new_base, 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(w.outstanding(), 2);
    }

    #[test]
    fn duplicate_and_out_of_window_acks_do_not_move_base() {
        let mut w = Window::new(8);
        for _ in 0..3 {
            w.acquire_seq();
        }
        assert!(matches!(w.on_ack(1), AckOutcome::Advanced { .. }));

        assert_eq!(w.on_ack(1), AckOutcome::Duplicate);
        assert_eq!(w.on_ack(0), AckOutcome::Duplicate);
        // seq 5 was never sent
        assert_eq!(w.on_ack(5), AckOutcome::OutOfWindow);
        assert_eq!(w.send_base(), 2);
    }

    #[test]
    fn base_never_regresses_across_wrap() {
        let mut w = Window::new(4);
        // Drive the window around the ring twice.
        for round in 0u32..8 {
            for _ in 0..4 {
                w.acquire_seq().unwrap();
            }
            let last = (round as u8 * 4 + 3) % SEQ_MOD;
            match w.on_ack(last) {
                AckOutcome::Advanced { acked, .. } => assert_eq!(acked.len(), 4),
                other => panic!("round {}: {:?}", round, other),
            }
            assert_eq!(w.outstanding(), 0);
        }
    }

    #[test]
    fn in_order_frames_deliver_immediately() {
        let mut w = Window::new(8);
        match w.on_frame(0, b"a".to_vec(), now()) {
            RecvOutcome::Delivered(frames) => {
                assert_eq!(frames, vec![(0, b"a".to_vec())]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(w.expected_seq(), 1);
    }

    #[test]
    fn out_of_order_frames_buffer_then_flush() {
        let mut w = Window::new(8);
        assert_eq!(w.on_frame(1, b"b".to_vec(), now()), RecvOutcome::Buffered);
        assert_eq!(w.on_frame(2, b"c".to_vec(), now()), RecvOutcome::Buffered);

        match w.on_frame(0, b"a".to_vec(), now()) {
            RecvOutcome::Delivered(frames) => {
                let seqs: Vec<u8> = frames.iter().map(|(s, _)| *s).collect();
                assert_eq!(seqs, vec![0, 1, 2]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(w.expected_seq(), 3);
    }

    #[test]
    fn old_frames_are_duplicates_and_far_frames_are_ignored() {
        let mut w = Window::new(8);
        for seq in 0..3u8 {
            w.on_frame(seq, vec![seq], now());
        }

        assert_eq!(w.on_frame(1, b"x".to_vec(), now()), RecvOutcome::Duplicate);
        assert_eq!(
            w.on_frame(12, b"y".to_vec(), now()),
            RecvOutcome::OutOfWindow
        );
        assert_eq!(w.expected_seq(), 3);
    }

    #[test]
    fn delivery_order_survives_wrap() {
        let mut w = Window::new(8);
        let mut seen = Vec::new();
        for i in 0..17u32 {
            let seq = (i % SEQ_MOD as u32) as u8;
            match w.on_frame(seq, vec![i as u8], now()) {
                RecvOutcome::Delivered(frames) => {
                    seen.extend(frames.into_iter().map(|(s, _)| s))
                }
                other => panic!("frame {}: {:?}", i, other),
            }
        }
        let expected: Vec<u8> = (0..17u32).map(|i| (i % 16) as u8).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn adjust_follows_the_hint_rules() {
        let mut w = Window::new(8);
        w.adjust(Duration::from_millis(50), 0.10);
        assert_eq!(w.window_size(), 4);
        w.adjust(Duration::from_millis(50), 0.02);
        assert_eq!(w.window_size(), 3);
        w.adjust(Duration::from_millis(50), 0.0);
        assert_eq!(w.window_size(), 4);
        w.adjust(Duration::from_millis(200), 0.0);
        assert_eq!(w.window_size(), 4);

        let mut small = Window::new(1);
        small.adjust(Duration::from_millis(50), 0.5);
        assert_eq!(small.window_size(), 1);
    }

    #[test]
    fn reset_clears_both_directions() {
        let mut w = Window::new(8);
        w.acquire_seq();
        w.acquire_seq();
        w.on_frame(1, b"x".to_vec(), now());
        w.reset();

        assert_eq!(w.send_base(), 0);
        assert_eq!(w.next_seq(), 0);
        assert_eq!(w.expected_seq(), 0);
        // Buffer cleared: seq 1 buffers anew rather than reading stale data.
        assert_eq!(w.on_frame(1, b"y".to_vec(), now()), RecvOutcome::Buffered);
    }
}
