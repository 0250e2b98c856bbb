//! Core data types shared by the classifier, the rally state machine and the
//! sync protocol.

use serde::{Deserialize, Serialize};

/// Onset threshold on gravity-compensated acceleration (m/s²).
pub const ONSET_THRESHOLD: f32 = 6.0;

/// Lower bound of the Medium tier (T1, m/s²).
pub const MEDIUM_THRESHOLD: f32 = 14.0;

/// Lower bound of the Hard tier (T2, m/s²).
pub const HARD_THRESHOLD: f32 = 24.0;

/// Angular velocity (rad/s) that maps to full spin.
pub const SPIN_FULL_SCALE: f32 = 20.0;

/// One raw motion sample as delivered by the platform sensor stack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Raw accelerometer reading [x, y, z] in m/s², gravity included.
    pub accel: [f32; 3],
    /// Gyroscope reading [x, y, z] in rad/s. `None` when the device has no gyro.
    #[serde(default)]
    pub gyro: Option<[f32; 3]>,
    /// Gravity vector [x, y, z] in m/s² as estimated by the platform.
    pub gravity: [f32; 3],
}

impl MotionSample {
    pub fn new(timestamp_ms: u64, accel: [f32; 3], gyro: Option<[f32; 3]>, gravity: [f32; 3]) -> Self {
        Self {
            timestamp_ms,
            accel,
            gyro,
            gravity,
        }
    }

    /// Acceleration with the gravity vector removed.
    pub fn linear_accel(&self) -> [f32; 3] {
        [
            self.accel[0] - self.gravity[0],
            self.accel[1] - self.gravity[1],
            self.accel[2] - self.gravity[2],
        ]
    }

    /// Magnitude of the gravity-compensated acceleration.
    pub fn linear_magnitude(&self) -> f32 {
        let [x, y, z] = self.linear_accel();
        (x * x + y * y + z * z).sqrt()
    }
}

/// Coarse bucket of swing intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForceTier {
    Soft,
    Medium,
    Hard,
}

impl ForceTier {
    /// Bucket a peak magnitude: below T1 is Soft, [T1, T2) Medium, T2 and above Hard.
    pub fn from_magnitude(magnitude: f32) -> Self {
        if magnitude >= HARD_THRESHOLD {
            ForceTier::Hard
        } else if magnitude >= MEDIUM_THRESHOLD {
            ForceTier::Medium
        } else {
            ForceTier::Soft
        }
    }

    /// Integer force used by the flight-time model. Integer so both devices
    /// derive identical timers.
    pub fn nominal_force(self) -> u64 {
        match self {
            ForceTier::Soft => 10,
            ForceTier::Medium => 18,
            ForceTier::Hard => 28,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ForceTier::Soft => 0,
            ForceTier::Medium => 1,
            ForceTier::Hard => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ForceTier::Soft),
            1 => Some(ForceTier::Medium),
            2 => Some(ForceTier::Hard),
            _ => None,
        }
    }
}

/// A classified paddle gesture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingEvent {
    /// Timestamp of the peak, in the classifying device's clock.
    pub timestamp_ms: u64,
    pub force: ForceTier,
    /// Horizontal unit vector; (1, 0) is straight down the table.
    pub direction: [f32; 2],
    /// Signed spin in [-1, 1]; 0.0 when the device has no gyroscope.
    pub spin: f32,
}

impl SwingEvent {
    pub fn new(timestamp_ms: u64, force: ForceTier, direction: [f32; 2], spin: f32) -> Self {
        Self {
            timestamp_ms,
            force,
            direction,
            spin,
        }
    }

    /// Build an event from an angle in degrees (0° = straight ahead).
    pub fn with_angle(timestamp_ms: u64, force: ForceTier, angle_deg: f32, spin: f32) -> Self {
        let rad = angle_deg.to_radians();
        Self::new(timestamp_ms, force, [rad.cos(), rad.sin()], spin)
    }

    /// Deviation from straight ahead, in degrees within (-180, 180].
    pub fn angle_deg(&self) -> f32 {
        self.direction[1].atan2(self.direction[0]).to_degrees()
    }
}

/// Which player a turn, point or swing belongs to, seen from this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// Rally phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    AwaitingServe,
    /// Ball travelling towards the player whose turn it is.
    BallInFlight,
    /// Ball has arrived; the return window is closing.
    AwaitingReturn,
    PointOver,
    MatchOver,
}

impl Phase {
    pub fn is_in_flight(self) -> bool {
        matches!(self, Phase::BallInFlight | Phase::AwaitingReturn)
    }
}

/// Outcome notifications, from the local player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Hit,
    Miss,
    Win,
    Lose,
}

/// How a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    Won,
    Lost,
    ConnectionLost,
}

/// Position of a swing within the match: `point` is the number of points
/// already played, `stroke` counts swings in the point (serve = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrokeId {
    pub point: u16,
    pub stroke: u16,
}

impl StrokeId {
    pub fn new(point: u16, stroke: u16) -> Self {
        Self { point, stroke }
    }
}

/// Snapshot of the match, from the sender's perspective, carried by `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSnapshot {
    pub points_played: u16,
    pub score_sender: u16,
    pub score_receiver: u16,
    pub sender_serves_next: bool,
}

impl ResetSnapshot {
    /// Total order used to settle competing resets: more points played wins.
    /// On a tie the sender that served the last played point wins, since
    /// serve alternates that is the one not serving next. Before any point is
    /// played the tie goes to the first server.
    pub fn rank(&self) -> (u16, bool) {
        let served_last = if self.points_played == 0 {
            self.sender_serves_next
        } else {
            !self.sender_serves_next
        };
        (self.points_played, served_last)
    }
}
