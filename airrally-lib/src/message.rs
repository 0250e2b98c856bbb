use chrono::Utc;
use serde::Serialize;

use crate::error::EngineError;
use crate::types::{ForceTier, MatchResult, Outcome, Side};

/// Notifications for the feedback sink (haptics, audio, UI):
/// - `Swing`      every swing the rally accepted, local or remote
/// - `Outcome`    hit / miss / win / lose, from the local player's view
/// - `Notice`     transient, non-fatal conditions (desync, sensor gap, bad frames)
/// - `MatchEnded` final result
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Feedback {
    Swing { tier: ForceTier, origin: Side },
    Outcome { outcome: Outcome },
    Notice { error: EngineError },
    MatchEnded { result: MatchResult, score_local: u16, score_remote: u16 },
}

/// A feedback item stamped with wall-clock time for subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct Notification {
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    pub feedback: Feedback,
}

impl Notification {
    pub fn now(feedback: Feedback) -> Self {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self { timestamp, feedback }
    }
}
