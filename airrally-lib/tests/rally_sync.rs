//! Two engines playing each other over a simulated link with a virtual clock.

use std::collections::HashSet;

use airrally_lib::wire::{FRAME_LEN, MessageKind};
use airrally_lib::{
    EngineError, Feedback, ForceTier, MatchEngine, MatchResult, MatchRules, Outcome, Phase, Side, StrokeId,
    SwingEvent, SyncConfig, SyncMessage,
};

const STEP_MS: u64 = 10;
const LATENCY_MS: u64 = 30;
const REACTION_MS: u64 = 300;
const MAX_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Dir {
    AtoB,
    BtoA,
}

enum Fate {
    Deliver,
    Drop,
    Duplicate,
    Delay(u64),
}

fn deliver_all(_: u64, _: Dir, _: &SyncMessage) -> Fate {
    Fate::Deliver
}

/// Hits every ball it can until the point has seen `strokes_in_point`
/// strokes, then lets the next one go.
struct Player {
    waiting: Option<(StrokeId, u64)>,
}

fn strokes_in_point(point: u16) -> u16 {
    2 + point % 3
}

impl Player {
    fn new() -> Self {
        Self { waiting: None }
    }

    fn act(&mut self, engine: &mut MatchEngine, now: u64) {
        let rally = engine.rally();
        let state = rally.state();
        let ready = state.turn == Side::Local
            && matches!(state.phase, Phase::AwaitingServe | Phase::AwaitingReturn);
        if !ready {
            self.waiting = None;
            return;
        }
        let id = rally.next_stroke();
        if id.stroke >= strokes_in_point(id.point) {
            return;
        }
        let since = match self.waiting {
            Some((waiting, since)) if waiting == id => since,
            _ => {
                self.waiting = Some((id, now));
                now
            }
        };
        if now >= since + REACTION_MS {
            let swing = if id.stroke == 0 {
                SwingEvent::with_angle(now, ForceTier::Hard, 0.0, 0.0)
            } else {
                SwingEvent::with_angle(now, ForceTier::Medium, 10.0, 0.2)
            };
            engine.on_local_swing(swing, now);
            self.waiting = None;
        }
    }
}

struct Sim<P> {
    a: MatchEngine,
    b: MatchEngine,
    now: u64,
    in_flight: Vec<(u64, Dir, [u8; FRAME_LEN])>,
    policy: P,
    players: Option<(Player, Player)>,
    feedback_a: Vec<Feedback>,
    feedback_b: Vec<Feedback>,
    sent: Vec<(u64, Dir, MessageKind)>,
}

impl<P> Sim<P>
where
    P: FnMut(u64, Dir, &SyncMessage) -> Fate,
{
    fn new(rules: MatchRules, policy: P) -> Self {
        Self::with_sync(rules, SyncConfig::default(), policy)
    }

    fn with_sync(rules: MatchRules, sync: SyncConfig, policy: P) -> Self {
        Self {
            a: MatchEngine::new(rules.clone(), sync.clone(), Side::Local, 0),
            b: MatchEngine::new(rules, sync, Side::Remote, 0),
            now: 0,
            in_flight: Vec::new(),
            policy,
            players: None,
            feedback_a: Vec::new(),
            feedback_b: Vec::new(),
            sent: Vec::new(),
        }
    }

    fn with_players(mut self) -> Self {
        self.players = Some((Player::new(), Player::new()));
        self
    }

    fn step(&mut self) {
        self.now += STEP_MS;
        let now = self.now;

        let (mut due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|(at, _, _)| *at <= now);
        self.in_flight = pending;
        due.sort_by_key(|(at, _, _)| *at);
        for (_, dir, frame) in due {
            match dir {
                Dir::AtoB => self.b.on_bytes(&frame, now),
                Dir::BtoA => self.a.on_bytes(&frame, now),
            }
        }

        self.a.tick(now);
        self.b.tick(now);
        if let Some((pa, pb)) = self.players.as_mut() {
            pa.act(&mut self.a, now);
            pb.act(&mut self.b, now);
        }

        self.transmit(Dir::AtoB);
        self.transmit(Dir::BtoA);
        self.feedback_a.extend(self.a.drain_feedback());
        self.feedback_b.extend(self.b.drain_feedback());
    }

    fn transmit(&mut self, dir: Dir) {
        let frames = match dir {
            Dir::AtoB => self.a.drain_outgoing(),
            Dir::BtoA => self.b.drain_outgoing(),
        };
        for frame in frames {
            let msg = SyncMessage::decode(&frame).expect("engine emits valid frames");
            let at = self.now + LATENCY_MS;
            self.sent.push((self.now, dir, msg.kind()));
            match (self.policy)(self.now, dir, &msg) {
                Fate::Deliver => self.in_flight.push((at, dir, frame)),
                Fate::Drop => {}
                Fate::Duplicate => {
                    self.in_flight.push((at, dir, frame));
                    self.in_flight.push((at + 5, dir, frame));
                }
                Fate::Delay(extra) => self.in_flight.push((at + extra, dir, frame)),
            }
        }
    }

    fn run_until(&mut self, t: u64) {
        while self.now < t {
            self.step();
        }
    }

    fn run_while(&mut self, mut cond: impl FnMut(&Self) -> bool) {
        while cond(self) {
            assert!(self.now < MAX_MS, "simulation did not settle");
            self.step();
        }
    }

    fn play_out(&mut self) {
        self.run_while(|sim| !(sim.a.is_over() && sim.b.is_over()));
    }

    fn assert_converged(&self) {
        let a = self.a.rally().state();
        let b = self.b.rally().state();
        assert_eq!((a.score_local, a.score_remote), (b.score_remote, b.score_local));
        match (self.a.result(), self.b.result()) {
            (Some(MatchResult::Won), Some(MatchResult::Lost))
            | (Some(MatchResult::Lost), Some(MatchResult::Won)) => {}
            other => panic!("results do not complement: {:?}", other),
        }
    }
}

fn short_match() -> MatchRules {
    MatchRules { target_score: 5, ..MatchRules::default() }
}

fn count_swings(feedback: &[Feedback], origin: Side) -> usize {
    feedback
        .iter()
        .filter(|f| matches!(f, Feedback::Swing { origin: o, .. } if *o == origin))
        .count()
}

#[test]
fn test_serve_return_then_server_misses() {
    let mut sim = Sim::new(MatchRules::default(), deliver_all);
    sim.run_until(100);
    sim.a.on_local_swing(SwingEvent::with_angle(100, ForceTier::Hard, 0.0, 0.0), sim.now);

    sim.run_while(|sim| sim.b.rally().phase() != Phase::AwaitingReturn);
    let now = sim.now;
    sim.b.on_local_swing(SwingEvent::with_angle(now, ForceTier::Medium, 15.0, 0.0), now);

    // A never swings again.
    sim.run_while(|sim| {
        !(sim.a.rally().phase() == Phase::PointOver && sim.b.rally().phase() == Phase::PointOver)
    });

    let a = sim.a.rally().state();
    let b = sim.b.rally().state();
    assert_eq!((a.score_local, a.score_remote), (0, 1));
    assert_eq!((b.score_local, b.score_remote), (1, 0));
    assert_eq!(a.last_outcome, Some(Outcome::Lose));
    assert_eq!(b.last_outcome, Some(Outcome::Win));
    assert!(sim.feedback_a.contains(&Feedback::Outcome { outcome: Outcome::Miss }));
    assert!(sim.feedback_a.contains(&Feedback::Swing { tier: ForceTier::Medium, origin: Side::Remote }));
}

#[test]
fn test_clean_link_scripted_match() {
    let mut sim = Sim::new(short_match(), deliver_all).with_players();
    sim.play_out();
    sim.assert_converged();

    // Points go B,B,B,A,A,A,B,B: B takes it 5-3.
    assert_eq!(sim.a.result(), Some(MatchResult::Lost));
    let a = sim.a.rally().state();
    assert_eq!((a.score_local, a.score_remote), (3, 5));
    assert_eq!(sim.a.sync().stats().retransmitted, 0);
}

#[test]
fn test_every_third_frame_dropped_once() {
    let mut count = 0u64;
    let mut dropped = HashSet::new();
    let policy = move |_: u64, dir: Dir, msg: &SyncMessage| {
        count += 1;
        if count % 3 == 0 && dropped.insert((dir, msg.kind(), msg.seq)) {
            Fate::Drop
        } else {
            Fate::Deliver
        }
    };
    let mut sim = Sim::new(short_match(), policy).with_players();
    sim.play_out();
    sim.assert_converged();
    assert!(sim.a.sync().stats().retransmitted + sim.b.sync().stats().retransmitted > 0);
    assert_eq!(count_swings(&sim.feedback_a, Side::Local), count_swings(&sim.feedback_b, Side::Remote));
    assert_eq!(count_swings(&sim.feedback_b, Side::Local), count_swings(&sim.feedback_a, Side::Remote));
}

#[test]
fn test_duplicated_and_reordered_frames() {
    let mut count = 0u64;
    let policy = move |_: u64, _: Dir, _: &SyncMessage| {
        count += 1;
        if count % 5 == 0 {
            Fate::Delay(40)
        } else if count % 4 == 0 {
            Fate::Duplicate
        } else {
            Fate::Deliver
        }
    };
    let mut sim = Sim::new(short_match(), policy).with_players();
    sim.play_out();
    sim.assert_converged();
}

#[test]
fn test_duplicates_never_double_apply() {
    let policy = |_: u64, _: Dir, msg: &SyncMessage| {
        if msg.kind() == MessageKind::Swing { Fate::Duplicate } else { Fate::Deliver }
    };
    let mut sim = Sim::new(short_match(), policy).with_players();
    sim.play_out();
    sim.assert_converged();

    assert!(sim.b.sync().stats().duplicates > 0);
    assert_eq!(count_swings(&sim.feedback_a, Side::Local), count_swings(&sim.feedback_b, Side::Remote));
    assert_eq!(count_swings(&sim.feedback_b, Side::Local), count_swings(&sim.feedback_a, Side::Remote));
}

#[test]
fn test_partition_ends_match_as_connection_lost() {
    let policy = |now: u64, _: Dir, _: &SyncMessage| if now > 1_000 { Fate::Drop } else { Fate::Deliver };
    let mut sim = Sim::new(short_match(), policy).with_players();
    sim.play_out();

    assert_eq!(sim.a.result(), Some(MatchResult::ConnectionLost));
    assert_eq!(sim.b.result(), Some(MatchResult::ConnectionLost));
    assert!(sim.now <= 1_000 + SyncConfig::default().liveness_timeout_ms + 2 * STEP_MS + LATENCY_MS);
}

#[test]
fn test_lost_serve_exhausts_retries_and_resets() {
    // Every copy of A's serve in the third point (its third swing) is lost.
    let policy = |_: u64, dir: Dir, msg: &SyncMessage| {
        if dir == Dir::AtoB && msg.kind() == MessageKind::Swing && msg.seq == 3 {
            Fate::Drop
        } else {
            Fate::Deliver
        }
    };
    let mut sim = Sim::new(short_match(), policy).with_players();
    sim.play_out();
    sim.assert_converged();

    assert!(sim.feedback_a.iter().any(|f| matches!(
        f,
        Feedback::Notice { error: EngineError::ProtocolDesync { seq: 3, .. } }
    )));
    let resets = |dir: Dir| sim.sent.iter().filter(|(_, d, k)| *d == dir && *k == MessageKind::Reset).count();
    assert!(resets(Dir::AtoB) >= 1);
    assert!(resets(Dir::BtoA) >= 1);
    assert!(sim.a.sync().stats().retransmitted >= u64::from(SyncConfig::default().max_retries));
}

#[test]
fn test_both_sides_time_out_then_point_goes_to_server() {
    // B's return reaches A only after both sides have given up on it.
    let policy = |_: u64, dir: Dir, msg: &SyncMessage| {
        if dir == Dir::BtoA && msg.kind() == MessageKind::Swing && msg.seq == 1 {
            Fate::Delay(1_500)
        } else {
            Fate::Deliver
        }
    };
    let sync = SyncConfig { max_retries: 20, ..SyncConfig::default() };
    let mut sim = Sim::with_sync(short_match(), sync, policy).with_players();

    // A has awarded itself the point; B is still waiting on A.
    sim.run_until(2_300);
    let a = sim.a.rally().state();
    let b = sim.b.rally().state();
    assert_eq!((a.score_local, a.score_remote), (1, 0));
    assert_eq!((b.score_local, b.score_remote), (0, 0));

    sim.run_until(2_700);
    let a = sim.a.rally().state();
    let b = sim.b.rally().state();
    assert_eq!((a.score_local, a.score_remote), (1, 0));
    assert_eq!((b.score_local, b.score_remote), (0, 1));
    assert_eq!(sim.a.rally().points_played(), 1);
    assert_eq!(sim.b.rally().points_played(), 1);
    assert_eq!((a.phase, a.turn), (Phase::AwaitingServe, Side::Remote));
    assert_eq!((b.phase, b.turn), (Phase::AwaitingServe, Side::Local));
    assert!(sim.sent.iter().any(|(_, d, k)| *d == Dir::AtoB && *k == MessageKind::Reset));

    sim.play_out();
    sim.assert_converged();
}
