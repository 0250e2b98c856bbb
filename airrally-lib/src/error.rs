use serde::Serialize;
use thiserror::Error;

/// Reasons a frame off the wire is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum WireError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported wire version {0}")]
    BadVersion(u8),

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum { expected: u16, actual: u16 },

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
}

/// Match-level conditions raised by the engine. None of these is fatal to the
/// process; `ConnectionLost` ends the match.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum EngineError {
    #[error("no motion samples for {idle_ms} ms")]
    SensorGap { idle_ms: u64 },

    #[error("message {seq} unacknowledged after {retries} retries, resetting rally")]
    ProtocolDesync { seq: u32, retries: u32 },

    #[error("rally desync: {reason}")]
    RallyDesync { reason: String },

    #[error("peer silent for {silent_ms} ms, connection lost")]
    ConnectionLost { silent_ms: u64 },

    #[error("invalid sync message: {0}")]
    InvalidMessage(#[from] WireError),
}

/// Errors reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid value")]
    Invalid { key: String, value: String },

    #[error("{0}")]
    Constraint(&'static str),
}

/// Errors from the sensor sources.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor feed already stopped")]
    Stopped,

    #[error("sensor read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad sample on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that abort a match session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
