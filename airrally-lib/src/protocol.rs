//! Sequenced, acknowledged delivery of rally messages over a lossy link.
//!
//! [`SyncEndpoint`] is sans-IO: callers feed it decoded messages and the
//! current time, and drain the messages it wants sent. Swing and Reset are
//! reliable (retransmitted until acked, delivered in sequence order, never
//! delivered twice); Ack and Ping are fire-and-forget.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, trace, warn};

use crate::types::{ResetSnapshot, StrokeId, SwingEvent};
use crate::wire::{MessageKind, Payload, SyncMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Resend an unacked reliable message after this long.
    pub ack_timeout_ms: u64,
    /// Resends before giving up on a message.
    pub max_retries: u32,
    /// Send a Ping after this long without sending anything.
    pub ping_interval_ms: u64,
    /// Declare the peer gone after this long without hearing anything.
    pub liveness_timeout_ms: u64,
    /// How far ahead of the expected sequence number messages are buffered.
    pub reorder_window: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 120,
            max_retries: 4,
            ping_interval_ms: 500,
            liveness_timeout_ms: 3_000,
            reorder_window: 32,
        }
    }
}

/// Payload handed to the rally, in the peer's send order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    Swing { stroke: StrokeId, event: SwingEvent },
    Reset(ResetSnapshot),
}

/// Conditions the endpoint cannot resolve by itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAlert {
    RetriesExhausted { seq: u32, kind: MessageKind, retries: u32 },
    ConnectionLost { silent_ms: u64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub sent: u64,
    pub retransmitted: u64,
    pub duplicates: u64,
    pub invalid: u64,
}

#[derive(Debug)]
struct Unacked {
    msg: SyncMessage,
    sent_at: u64,
    retries: u32,
}

pub struct SyncEndpoint {
    config: SyncConfig,
    next_seq: u32,
    next_ping: u32,
    unacked: BTreeMap<u32, Unacked>,
    expected: u32,
    reorder: BTreeMap<u32, SyncMessage>,
    last_sent_at: u64,
    last_heard_at: u64,
    outbox: VecDeque<SyncMessage>,
    closed: bool,
    stats: SyncStats,
}

impl SyncEndpoint {
    pub fn new(config: SyncConfig, now: u64) -> Self {
        Self {
            config,
            next_seq: 1,
            next_ping: 1,
            unacked: BTreeMap::new(),
            expected: 1,
            reorder: BTreeMap::new(),
            last_sent_at: now,
            last_heard_at: now,
            outbox: VecDeque::new(),
            closed: false,
            stats: SyncStats::default(),
        }
    }

    /// Queue a swing for the peer. Returns its sequence number, or `None`
    /// once the endpoint is shut down.
    pub fn send_swing(&mut self, stroke: StrokeId, event: SwingEvent, now: u64) -> Option<u32> {
        if self.closed {
            return None;
        }
        let seq = self.take_seq();
        self.send_reliable(SyncMessage::swing(seq, stroke, event), now);
        Some(seq)
    }

    /// Queue a reset. Anything older still waiting for an ack is superseded.
    pub fn send_reset(&mut self, snapshot: ResetSnapshot, now: u64) -> Option<u32> {
        if self.closed {
            return None;
        }
        if !self.unacked.is_empty() {
            debug!("reset supersedes {} unacked messages", self.unacked.len());
            self.unacked.clear();
        }
        let seq = self.take_seq();
        info!("sending reset #{}: {:?}", seq, snapshot);
        self.send_reliable(SyncMessage::reset(seq, snapshot), now);
        Some(seq)
    }

    /// Process one message from the peer and return what became deliverable.
    pub fn on_receive(&mut self, msg: SyncMessage, now: u64) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if self.closed {
            return deliveries;
        }
        self.last_heard_at = now;

        // The receive window advances to `seq + 1`, which the last number
        // cannot reach; our own counter never hands it out either.
        if msg.is_reliable() && msg.seq == u32::MAX {
            warn!("dropping {:?} with out-of-range sequence number", msg.kind());
            self.stats.invalid += 1;
            return deliveries;
        }

        match msg.payload {
            Payload::Ack { next_expected } => {
                if self.unacked.remove(&msg.seq).is_some() {
                    trace!("ack #{}", msg.seq);
                }
                self.release_below(next_expected);
                if next_expected < msg.seq {
                    self.resend_gap(next_expected, msg.seq, now);
                }
            }
            Payload::Ping { next_expected } => {
                trace!("ping #{}", msg.seq);
                self.release_below(next_expected);
            }
            Payload::Reset(snapshot) => {
                if msg.seq >= self.expected {
                    self.expected = msg.seq + 1;
                    self.reorder = self.reorder.split_off(&self.expected);
                    deliveries.push(Delivery::Reset(snapshot));
                    self.drain_reorder(&mut deliveries);
                } else {
                    self.stats.duplicates += 1;
                }
                self.push(SyncMessage::ack(msg.seq, self.expected), now);
            }
            Payload::Swing { .. } => self.receive_swing(msg, now, &mut deliveries),
        }
        deliveries
    }

    /// Retransmit, ping and check liveness. Call regularly.
    pub fn poll(&mut self, now: u64) -> Option<SyncAlert> {
        if self.closed {
            return None;
        }
        let silent_ms = now.saturating_sub(self.last_heard_at);
        if silent_ms >= self.config.liveness_timeout_ms {
            return Some(SyncAlert::ConnectionLost { silent_ms });
        }

        let mut resend = Vec::new();
        let mut exhausted = None;
        for (seq, entry) in self.unacked.iter_mut() {
            if now.saturating_sub(entry.sent_at) < self.config.ack_timeout_ms {
                continue;
            }
            if entry.retries >= self.config.max_retries {
                exhausted = Some(SyncAlert::RetriesExhausted {
                    seq: *seq,
                    kind: entry.msg.kind(),
                    retries: entry.retries,
                });
                break;
            }
            entry.retries += 1;
            entry.sent_at = now;
            resend.push(entry.msg);
        }
        for msg in resend {
            debug!("retransmitting #{} ({:?})", msg.seq, msg.kind());
            self.stats.retransmitted += 1;
            self.push(msg, now);
        }
        if let Some(SyncAlert::RetriesExhausted { seq, .. }) = exhausted {
            warn!("message #{} exhausted its retries", seq);
            self.unacked.remove(&seq);
            return exhausted;
        }

        if now.saturating_sub(self.last_sent_at) >= self.config.ping_interval_ms {
            let seq = self.next_ping;
            self.next_ping = self.next_ping.wrapping_add(1);
            self.push(SyncMessage::ping(seq, self.expected), now);
        }
        None
    }

    /// Messages to put on the wire, oldest first.
    pub fn drain_outbox(&mut self) -> Vec<SyncMessage> {
        if self.closed {
            self.outbox.clear();
            return Vec::new();
        }
        self.outbox.drain(..).collect()
    }

    /// Stop for good: pending and unacked messages are discarded and nothing
    /// is sent afterwards.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        info!(
            "sync endpoint closing, discarding {} unacked and {} queued messages",
            self.unacked.len(),
            self.outbox.len()
        );
        self.closed = true;
        self.unacked.clear();
        self.outbox.clear();
        self.reorder.clear();
    }

    pub fn note_invalid(&mut self) {
        self.stats.invalid += 1;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn next_expected(&self) -> u32 {
        self.expected
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = match self.next_seq.checked_add(1) {
            Some(next) if next < u32::MAX => next,
            _ => 1,
        };
        seq
    }

    fn send_reliable(&mut self, msg: SyncMessage, now: u64) {
        self.unacked.insert(msg.seq, Unacked { msg, sent_at: now, retries: 0 });
        self.push(msg, now);
    }

    fn push(&mut self, msg: SyncMessage, now: u64) {
        self.stats.sent += 1;
        self.last_sent_at = now;
        self.outbox.push_back(msg);
    }

    fn receive_swing(&mut self, msg: SyncMessage, now: u64, deliveries: &mut Vec<Delivery>) {
        let seq = msg.seq;
        if seq < self.expected {
            trace!("duplicate #{}", seq);
            self.stats.duplicates += 1;
        } else if seq == self.expected {
            self.deliver(msg, deliveries);
            self.expected += 1;
            self.drain_reorder(deliveries);
        } else if seq - self.expected <= self.config.reorder_window {
            debug!("gap: got #{} while expecting #{}", seq, self.expected);
            self.reorder.insert(seq, msg);
        } else {
            // Not buffered, so not acked either; the sender will retry.
            warn!("dropping #{}: beyond reorder window at #{}", seq, self.expected);
            return;
        }
        self.push(SyncMessage::ack(seq, self.expected), now);
    }

    fn drain_reorder(&mut self, deliveries: &mut Vec<Delivery>) {
        while let Some(msg) = self.reorder.remove(&self.expected) {
            self.deliver(msg, deliveries);
            self.expected += 1;
        }
    }

    fn deliver(&self, msg: SyncMessage, deliveries: &mut Vec<Delivery>) {
        match msg.payload {
            Payload::Swing { stroke, event } => deliveries.push(Delivery::Swing { stroke, event }),
            Payload::Reset(snapshot) => deliveries.push(Delivery::Reset(snapshot)),
            Payload::Ack { .. } | Payload::Ping { .. } => {}
        }
    }

    /// Everything below the peer's next expected number has been delivered.
    fn release_below(&mut self, next_expected: u32) {
        self.unacked.retain(|seq, _| *seq >= next_expected);
    }

    /// The peer holds `acked` but is missing `[from, acked)`: resend those now
    /// unless they were just sent.
    fn resend_gap(&mut self, from: u32, acked: u32, now: u64) {
        let min_age = self.config.ack_timeout_ms / 2;
        let mut resend = Vec::new();
        for (_, entry) in self.unacked.range_mut(from..acked) {
            if now.saturating_sub(entry.sent_at) >= min_age && entry.retries < self.config.max_retries {
                entry.retries += 1;
                entry.sent_at = now;
                resend.push(entry.msg);
            }
        }
        for msg in resend {
            debug!("peer missing #{}, resending", msg.seq);
            self.stats.retransmitted += 1;
            self.push(msg, now);
        }
    }
}
