//! One device's side of a match: rally state machine plus sync endpoint.
//!
//! `MatchEngine` performs no I/O and reads no clock. The session driver (or a
//! test harness) feeds it local swings, received bytes and the current time,
//! then drains frames to write and feedback to publish.

use log::{info, warn};

use crate::error::EngineError;
use crate::message::Feedback;
use crate::protocol::{Delivery, SyncAlert, SyncConfig, SyncEndpoint};
use crate::rally::{MatchRules, RallyStateMachine, RemoteVerdict};
use crate::types::{MatchResult, Phase, Side, SwingEvent};
use crate::wire::{FRAME_LEN, FrameDecoder, MessageKind, SyncMessage};

pub struct MatchEngine {
    rally: RallyStateMachine,
    sync: SyncEndpoint,
    decoder: FrameDecoder,
    feedback: Vec<Feedback>,
}

impl MatchEngine {
    pub fn new(rules: MatchRules, sync: SyncConfig, first_server: Side, now: u64) -> Self {
        info!("match starting, first server {:?}", first_server);
        Self {
            rally: RallyStateMachine::new(rules, first_server),
            sync: SyncEndpoint::new(sync, now),
            decoder: FrameDecoder::new(),
            feedback: Vec::new(),
        }
    }

    /// Apply a locally classified swing and, if the rally took it, send it.
    pub fn on_local_swing(&mut self, swing: SwingEvent, now: u64) {
        if self.is_over() {
            return;
        }
        if let Some(stroke) = self.rally.apply_local(swing, now, &mut self.feedback) {
            self.sync.send_swing(stroke, swing, now);
        }
    }

    /// Feed raw bytes from the transport.
    pub fn on_bytes(&mut self, bytes: &[u8], now: u64) {
        for result in self.decoder.push(bytes) {
            match result {
                Ok(msg) => self.on_message(msg, now),
                Err(e) => {
                    warn!("discarding invalid frame: {}", e);
                    self.sync.note_invalid();
                    self.feedback.push(Feedback::Notice { error: EngineError::InvalidMessage(e) });
                }
            }
        }
    }

    /// Feed one decoded message.
    pub fn on_message(&mut self, msg: SyncMessage, now: u64) {
        for delivery in self.sync.on_receive(msg, now) {
            match delivery {
                Delivery::Swing { stroke, event } => {
                    match self.rally.apply_remote(event, stroke, now, &mut self.feedback) {
                        RemoteVerdict::Applied | RemoteVerdict::Stale => {}
                        RemoteVerdict::Desync(reason) => self.resync(reason, now),
                    }
                }
                Delivery::Reset(snapshot) => {
                    if !self.rally.adopt_reset(snapshot, &mut self.feedback) {
                        let ours = self.rally.force_reset(&mut self.feedback);
                        self.sync.send_reset(ours, now);
                    }
                }
            }
        }
    }

    /// Advance rally timers and protocol housekeeping.
    pub fn tick(&mut self, now: u64) {
        if self.is_over() {
            return;
        }
        self.rally.tick(now, &mut self.feedback);

        match self.sync.poll(now) {
            Some(SyncAlert::RetriesExhausted { seq, kind: MessageKind::Reset, .. }) => {
                warn!("reset #{} never acknowledged, waiting on liveness", seq);
            }
            Some(SyncAlert::RetriesExhausted { seq, retries, .. }) => {
                let error = EngineError::ProtocolDesync { seq, retries };
                warn!("{}", error);
                self.feedback.push(Feedback::Notice { error });
                let ours = self.rally.force_reset(&mut self.feedback);
                self.sync.send_reset(ours, now);
            }
            Some(SyncAlert::ConnectionLost { silent_ms }) => {
                let error = EngineError::ConnectionLost { silent_ms };
                warn!("{}", error);
                self.feedback.push(Feedback::Notice { error });
                self.rally.connection_lost(&mut self.feedback);
            }
            None => {}
        }
    }

    /// The transport closed underneath us.
    pub fn on_transport_closed(&mut self) {
        if self.is_over() {
            return;
        }
        let error = EngineError::ConnectionLost { silent_ms: 0 };
        warn!("transport closed by peer");
        self.feedback.push(Feedback::Notice { error });
        self.rally.connection_lost(&mut self.feedback);
    }

    pub fn note_sensor_gap(&mut self, idle_ms: u64) {
        self.feedback.push(Feedback::Notice { error: EngineError::SensorGap { idle_ms } });
    }

    /// Encoded frames to write, oldest first. Empty after shutdown.
    pub fn drain_outgoing(&mut self) -> Vec<[u8; FRAME_LEN]> {
        self.sync.drain_outbox().iter().map(SyncMessage::encode).collect()
    }

    pub fn drain_feedback(&mut self) -> Vec<Feedback> {
        std::mem::take(&mut self.feedback)
    }

    /// Begin teardown: unacked messages are discarded, nothing more is sent.
    pub fn shutdown(&mut self) {
        self.sync.shutdown();
    }

    pub fn is_over(&self) -> bool {
        self.rally.phase() == Phase::MatchOver
    }

    pub fn result(&self) -> Option<MatchResult> {
        self.rally.result()
    }

    pub fn rally(&self) -> &RallyStateMachine {
        &self.rally
    }

    pub fn sync(&self) -> &SyncEndpoint {
        &self.sync
    }

    fn resync(&mut self, reason: String, now: u64) {
        let error = EngineError::RallyDesync { reason };
        warn!("{}", error);
        self.feedback.push(Feedback::Notice { error });
        let ours = self.rally.force_reset(&mut self.feedback);
        self.sync.send_reset(ours, now);
    }
}
