//! airrally-lib: swing classification, rally state and peer synchronization

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod rally;
pub mod sensor;
pub mod session;
pub mod types;
pub mod wire;

// feedback fan-out:
pub mod context;
pub mod message;

// re-exports for ergonomic imports:
pub use context::Context;
pub use message::{Feedback, Notification};

pub use classifier::{ClassifierConfig, SwingClassifier};
pub use config::RallyConfig;
pub use engine::MatchEngine;
pub use error::{ConfigError, EngineError, SensorError, SessionError, WireError};
pub use protocol::{SyncConfig, SyncEndpoint};
pub use rally::{MatchRules, RallyStateMachine};
pub use sensor::{SensorFeed, run_replay_blocking as run_replay};
pub use session::{MatchSummary, run_match};
pub use types::{ForceTier, MatchResult, MotionSample, Outcome, Phase, Side, StrokeId, SwingEvent};
pub use wire::{FrameDecoder, SyncMessage};
