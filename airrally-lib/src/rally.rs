//! Rally state machine.
//!
//! Each device owns one [`RallyStateMachine`] and treats it as authoritative
//! for its own view of the match. Local swings are applied optimistically as
//! soon as they are classified; remote swings arrive through the sync protocol
//! tagged with a [`StrokeId`], which lets this side tell a stale duplicate, a
//! late return and the next serve apart. All times are milliseconds on the
//! local clock supplied by the caller.

use log::{debug, info, warn};

use crate::error::EngineError;
use crate::message::Feedback;
use crate::types::{
    ForceTier, MatchResult, Outcome, Phase, ResetSnapshot, Side, StrokeId, SwingEvent,
};

/// Flight time is `FLIGHT_CONSTANT_MS / nominal_force`, clamped.
pub const FLIGHT_CONSTANT_MS: u64 = 12_000;
pub const MIN_FLIGHT_MS: u64 = 400;
pub const MAX_FLIGHT_MS: u64 = 1_200;

/// Time for the ball to reach the other side. Harder shots travel faster.
pub fn flight_time_ms(tier: ForceTier) -> u64 {
    (FLIGHT_CONSTANT_MS / tier.nominal_force()).clamp(MIN_FLIGHT_MS, MAX_FLIGHT_MS)
}

/// Match rules and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRules {
    pub target_score: u16,
    pub win_margin: u16,
    /// Time after the ball arrives in which the receiver may still return it.
    pub reaction_window_ms: u64,
    /// Extra allowance when the return is owed by the remote player.
    pub remote_grace_ms: u64,
    /// Time spent in `PointOver` before the next serve.
    pub point_pause_ms: u64,
    /// Returns deviating more than this from straight ahead land out.
    pub out_of_bounds_deg: f32,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            target_score: 11,
            win_margin: 2,
            reaction_window_ms: 600,
            remote_grace_ms: 250,
            point_pause_ms: 1_200,
            out_of_bounds_deg: 60.0,
        }
    }
}

impl MatchRules {
    /// Time from a hit until the return is overdue.
    pub fn return_window_ms(&self, tier: ForceTier) -> u64 {
        flight_time_ms(tier) + self.reaction_window_ms
    }

    pub fn is_out_of_bounds(&self, swing: &SwingEvent) -> bool {
        swing.angle_deg().abs() > self.out_of_bounds_deg
    }
}

/// Observable state of the rally.
#[derive(Debug, Clone, PartialEq)]
pub struct RallyState {
    pub phase: Phase,
    pub score_local: u16,
    pub score_remote: u16,
    /// Player who must hit next.
    pub turn: Side,
    pub last_shot: Option<SwingEvent>,
    pub last_outcome: Option<Outcome>,
}

/// What happened to a swing received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteVerdict {
    Applied,
    /// Already applied or superseded; ignore.
    Stale,
    /// Cannot be reconciled locally; the caller should reset the rally.
    Desync(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BallTimer {
    arrive_at: u64,
    expires_at: u64,
}

/// State saved when a point is awarded because the peer's return never came.
/// If that return shows up late and the peer served the point, the award is
/// undone and the return applied.
#[derive(Debug, Clone)]
struct PendingAward {
    expected: StrokeId,
    remote_served: bool,
    state: RallyState,
    timer: Option<BallTimer>,
}

pub struct RallyStateMachine {
    rules: MatchRules,
    first_server: Side,
    state: RallyState,
    point: u16,
    stroke: u16,
    timer: Option<BallTimer>,
    pause_until: Option<u64>,
    pending_award: Option<PendingAward>,
    result: Option<MatchResult>,
}

impl RallyStateMachine {
    pub fn new(rules: MatchRules, first_server: Side) -> Self {
        Self {
            rules,
            first_server,
            state: RallyState {
                phase: Phase::AwaitingServe,
                score_local: 0,
                score_remote: 0,
                turn: first_server,
                last_shot: None,
                last_outcome: None,
            },
            point: 0,
            stroke: 0,
            timer: None,
            pause_until: None,
            pending_award: None,
            result: None,
        }
    }

    pub fn state(&self) -> &RallyState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    pub fn result(&self) -> Option<MatchResult> {
        self.result
    }

    /// Id the next swing in this match will carry.
    pub fn next_stroke(&self) -> StrokeId {
        StrokeId::new(self.point, self.stroke)
    }

    pub fn points_played(&self) -> u16 {
        self.point
    }

    /// Serve alternates every point, starting with `first_server`.
    pub fn server_of(&self, point: u16) -> Side {
        if point % 2 == 0 {
            self.first_server
        } else {
            self.first_server.opposite()
        }
    }

    /// Apply a swing classified on this device. Returns the stroke id to send
    /// to the peer, or `None` when the swing is out of turn and ignored.
    pub fn apply_local(&mut self, swing: SwingEvent, now: u64, out: &mut Vec<Feedback>) -> Option<StrokeId> {
        if !self.accepts_hit_from(Side::Local) {
            debug!(
                "ignoring local swing in {:?} (turn {:?})",
                self.state.phase, self.state.turn
            );
            return None;
        }
        let id = self.next_stroke();
        self.hit(Side::Local, swing, now, out);
        Some(id)
    }

    /// Apply a swing the peer classified, in sequence order.
    pub fn apply_remote(
        &mut self,
        swing: SwingEvent,
        id: StrokeId,
        now: u64,
        out: &mut Vec<Feedback>,
    ) -> RemoteVerdict {
        if self.state.phase == Phase::MatchOver {
            return RemoteVerdict::Stale;
        }

        // The peer settled the open point and already served the next one.
        if id.stroke == 0 && id.point == self.point + 1 && self.state.phase.is_in_flight() {
            let loser = self.state.turn;
            warn!(
                "peer served point {} while point {} was open, settling it against {:?}",
                id.point, self.point, loser
            );
            if loser == Side::Local {
                self.set_outcome(Outcome::Miss, out);
            }
            self.close_point(loser.opposite(), now, out);
        }
        if id.stroke == 0 && id.point == self.point && self.state.phase == Phase::PointOver {
            self.finish_point(out);
        }

        if id == self.next_stroke() && self.accepts_hit_from(Side::Remote) {
            self.hit(Side::Remote, swing, now, out);
            return RemoteVerdict::Applied;
        }

        if let Some(award) = self.pending_award.take() {
            if award.expected == id {
                if award.remote_served {
                    warn!(
                        "late return for point {} from the serving peer, undoing the award",
                        id.point
                    );
                    self.point = id.point;
                    self.stroke = id.stroke;
                    self.state = award.state;
                    self.timer = award.timer;
                    self.pause_until = None;
                    out.push(Feedback::Notice {
                        error: EngineError::RallyDesync {
                            reason: format!("late return for point {} accepted", id.point),
                        },
                    });
                    self.hit(Side::Remote, swing, now, out);
                    return RemoteVerdict::Applied;
                }
                return RemoteVerdict::Desync(format!(
                    "late return for point {} which this device served and closed",
                    id.point
                ));
            }
            self.pending_award = Some(award);
        }

        if id < self.next_stroke() {
            debug!("stale remote swing {:?} (at {:?})", id, self.next_stroke());
            return RemoteVerdict::Stale;
        }

        RemoteVerdict::Desync(format!(
            "remote swing {:?} does not fit {:?} at {:?} (turn {:?})",
            id,
            self.state.phase,
            self.next_stroke(),
            self.state.turn
        ))
    }

    /// Advance timers: ball arrival, return window expiry, point pause.
    pub fn tick(&mut self, now: u64, out: &mut Vec<Feedback>) {
        match self.state.phase {
            Phase::BallInFlight | Phase::AwaitingReturn => {
                let Some(timer) = self.timer else {
                    return;
                };
                if now >= timer.expires_at {
                    let loser = self.state.turn;
                    if loser == Side::Remote {
                        self.pending_award = Some(PendingAward {
                            expected: self.next_stroke(),
                            remote_served: self.server_of(self.point) == Side::Remote,
                            state: self.state.clone(),
                            timer: self.timer,
                        });
                    } else {
                        self.set_outcome(Outcome::Miss, out);
                    }
                    debug!("return window expired, {:?} missed", loser);
                    self.close_point(loser.opposite(), now, out);
                } else if self.state.phase == Phase::BallInFlight && now >= timer.arrive_at {
                    self.state.phase = Phase::AwaitingReturn;
                }
            }
            Phase::PointOver => {
                if self.pause_until.is_some_and(|until| now >= until) {
                    self.finish_point(out);
                }
            }
            Phase::AwaitingServe | Phase::MatchOver => {}
        }
    }

    /// Snapshot of this side's view, as carried by a `Reset` it sends.
    pub fn snapshot(&self) -> ResetSnapshot {
        ResetSnapshot {
            points_played: self.point,
            score_sender: self.state.score_local,
            score_receiver: self.state.score_remote,
            sender_serves_next: self.server_of(self.point) == Side::Local,
        }
    }

    /// Abandon any open rally, keeping the score, and return the snapshot to
    /// send. A point in progress is replayed by the same server.
    pub fn force_reset(&mut self, out: &mut Vec<Feedback>) -> ResetSnapshot {
        match self.state.phase {
            Phase::BallInFlight | Phase::AwaitingReturn => {
                info!("abandoning point {} at stroke {}", self.point, self.stroke);
                self.stroke = 0;
                self.timer = None;
                self.state.phase = Phase::AwaitingServe;
                self.state.turn = self.server_of(self.point);
            }
            Phase::PointOver => self.finish_point(out),
            Phase::AwaitingServe => self.stroke = 0,
            Phase::MatchOver => {}
        }
        self.pending_award = None;
        self.snapshot()
    }

    /// Adopt the peer's snapshot unless ours ranks higher. Returns whether it
    /// was adopted; if not, the caller answers with its own snapshot.
    pub fn adopt_reset(&mut self, theirs: ResetSnapshot, out: &mut Vec<Feedback>) -> bool {
        let ours = self.snapshot();
        if ours.rank() > theirs.rank() {
            info!("keeping local state over peer reset ({:?} > {:?})", ours.rank(), theirs.rank());
            return false;
        }
        if ours.points_played != theirs.points_played
            || ours.score_sender != theirs.score_receiver
            || ours.score_receiver != theirs.score_sender
        {
            warn!(
                "adopting peer reset: points {} -> {}, score {}-{} -> {}-{}",
                ours.points_played,
                theirs.points_played,
                ours.score_sender,
                ours.score_receiver,
                theirs.score_receiver,
                theirs.score_sender
            );
        }

        let next = if theirs.sender_serves_next { Side::Remote } else { Side::Local };
        self.first_server = if theirs.points_played % 2 == 0 { next } else { next.opposite() };
        self.point = theirs.points_played;
        self.stroke = 0;
        self.timer = None;
        self.pause_until = None;
        self.pending_award = None;
        self.state.score_local = theirs.score_receiver;
        self.state.score_remote = theirs.score_sender;
        if self.state.phase != Phase::MatchOver {
            self.finish_point(out);
        }
        true
    }

    /// End the match because the peer went away.
    pub fn connection_lost(&mut self, out: &mut Vec<Feedback>) {
        if self.state.phase == Phase::MatchOver {
            return;
        }
        self.end_match(MatchResult::ConnectionLost, out);
    }

    fn accepts_hit_from(&self, side: Side) -> bool {
        self.state.turn == side
            && (self.state.phase == Phase::AwaitingServe || self.state.phase.is_in_flight())
    }

    fn hit(&mut self, side: Side, swing: SwingEvent, now: u64, out: &mut Vec<Feedback>) {
        let serve = self.state.phase == Phase::AwaitingServe;
        out.push(Feedback::Swing { tier: swing.force, origin: side });
        self.pending_award = None;
        self.stroke += 1;
        self.state.last_shot = Some(swing);

        // Serves never fault; only returns can land out.
        if !serve && self.rules.is_out_of_bounds(&swing) {
            info!("{:?} return at {:.0}° is out", side, swing.angle_deg());
            if side == Side::Local {
                self.set_outcome(Outcome::Miss, out);
            }
            self.close_point(side.opposite(), now, out);
            return;
        }

        if side == Side::Local {
            self.set_outcome(Outcome::Hit, out);
        }
        let flight = flight_time_ms(swing.force);
        let mut window = self.rules.return_window_ms(swing.force);
        if side == Side::Local {
            window += self.rules.remote_grace_ms;
        }
        self.timer = Some(BallTimer {
            arrive_at: now + flight,
            expires_at: now + window,
        });
        self.state.phase = Phase::BallInFlight;
        self.state.turn = side.opposite();
    }

    fn close_point(&mut self, winner: Side, now: u64, out: &mut Vec<Feedback>) {
        match winner {
            Side::Local => {
                self.state.score_local += 1;
                self.set_outcome(Outcome::Win, out);
            }
            Side::Remote => {
                self.state.score_remote += 1;
                self.set_outcome(Outcome::Lose, out);
            }
        }
        info!(
            "point {} to {:?}, score {}-{}",
            self.point, winner, self.state.score_local, self.state.score_remote
        );
        self.point += 1;
        self.stroke = 0;
        self.timer = None;
        self.state.phase = Phase::PointOver;
        self.pause_until = Some(now + self.rules.point_pause_ms);
    }

    fn finish_point(&mut self, out: &mut Vec<Feedback>) {
        self.pause_until = None;
        match self.winner() {
            Some(Side::Local) => self.end_match(MatchResult::Won, out),
            Some(Side::Remote) => self.end_match(MatchResult::Lost, out),
            None => {
                self.state.phase = Phase::AwaitingServe;
                self.state.turn = self.server_of(self.point);
            }
        }
    }

    fn winner(&self) -> Option<Side> {
        let (local, remote) = (self.state.score_local, self.state.score_remote);
        let target = self.rules.target_score;
        let margin = self.rules.win_margin;
        if local >= target && local >= remote + margin {
            Some(Side::Local)
        } else if remote >= target && remote >= local + margin {
            Some(Side::Remote)
        } else {
            None
        }
    }

    fn end_match(&mut self, result: MatchResult, out: &mut Vec<Feedback>) {
        info!(
            "match over: {:?} ({}-{})",
            result, self.state.score_local, self.state.score_remote
        );
        self.state.phase = Phase::MatchOver;
        self.timer = None;
        self.pause_until = None;
        self.result = Some(result);
        out.push(Feedback::MatchEnded {
            result,
            score_local: self.state.score_local,
            score_remote: self.state.score_remote,
        });
    }

    fn set_outcome(&mut self, outcome: Outcome, out: &mut Vec<Feedback>) {
        self.state.last_outcome = Some(outcome);
        out.push(Feedback::Outcome { outcome });
    }
}
