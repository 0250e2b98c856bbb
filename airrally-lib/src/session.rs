//! Async driver for one match.
//!
//! A single task owns the classifier and the [`MatchEngine`], so sample
//! handling, received frames and timers are applied strictly one at a time.
//! The task selects over the sensor queue, the transport, a housekeeping tick
//! and a shutdown signal; after every step it writes whatever frames the
//! engine produced and publishes its feedback.

use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc::Receiver, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::classifier::SwingClassifier;
use crate::config::RallyConfig;
use crate::context::Context;
use crate::engine::MatchEngine;
use crate::error::SessionError;
use crate::protocol::SyncStats;
use crate::types::{MatchResult, MotionSample, Side};

const READ_BUF: usize = 1024;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSummary {
    /// `None` when the session was shut down before the match finished.
    pub result: Option<MatchResult>,
    pub score_local: u16,
    pub score_remote: u16,
    pub swings_detected: u64,
    #[serde(skip)]
    pub sync_stats: SyncStats,
}

/// Play one match over `transport`.
///
/// Returns when the match ends, when `shutdown` flips to `true`, or with an
/// error if the transport fails. On return the sample queue is closed (which
/// stops the producing [`crate::SensorFeed`]), unacknowledged messages are
/// discarded and the transport is shut down; nothing is written afterwards.
pub async fn run_match<T>(
    transport: T,
    mut samples: Receiver<MotionSample>,
    ctx: Context,
    config: RallyConfig,
    first_server: Side,
    mut shutdown: watch::Receiver<bool>,
) -> Result<MatchSummary, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let clock = move || started.elapsed().as_millis() as u64;

    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut classifier = SwingClassifier::new(config.classifier.clone());
    let mut engine = MatchEngine::new(config.rules.clone(), config.sync.clone(), first_server, clock());
    let idle_timeout = config.classifier.idle_timeout_ms;
    // Give the peer time to see acks for our last messages before hanging up.
    let linger = config.sync.ack_timeout_ms * 2;

    let mut ticker = interval(Duration::from_millis(config.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = [0u8; READ_BUF];
    let mut samples_open = true;
    let mut transport_open = true;
    let mut shutdown_open = true;
    let mut last_sample: Option<u64> = None;
    let mut gap_reported = false;
    let mut over_since: Option<u64> = None;
    let mut failure: Option<std::io::Error> = None;

    if *shutdown.borrow() {
        info!("shutdown requested before the match started");
    } else {
        loop {
            tokio::select! {
                sample = samples.recv(), if samples_open && over_since.is_none() => match sample {
                    Some(sample) => {
                        let now = clock();
                        last_sample = Some(now);
                        gap_reported = false;
                        if let Some(swing) = classifier.classify(&sample) {
                            engine.on_local_swing(swing, now);
                        }
                    }
                    None => {
                        info!("sensor feed closed");
                        samples_open = false;
                    }
                },
                read = reader.read(&mut buf), if transport_open => match read {
                    Ok(0) => {
                        info!("transport closed by peer");
                        transport_open = false;
                        engine.on_transport_closed();
                    }
                    Ok(n) => engine.on_bytes(&buf[..n], clock()),
                    Err(e) => {
                        error!("transport read failed: {}", e);
                        transport_open = false;
                        engine.on_transport_closed();
                        failure = Some(e);
                    }
                },
                _ = ticker.tick() => {
                    let now = clock();
                    if let Some(last) = last_sample {
                        let idle_ms = now.saturating_sub(last);
                        if idle_ms > idle_timeout && !gap_reported {
                            gap_reported = true;
                            debug!("no motion samples for {} ms", idle_ms);
                            if let Some(swing) = classifier.flush_stalled() {
                                engine.on_local_swing(swing, now);
                            }
                            engine.note_sensor_gap(idle_ms);
                        }
                    }
                    engine.tick(now);
                },
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    } else if *shutdown.borrow() {
                        info!("shutdown requested, abandoning match");
                        break;
                    }
                },
            }

            if transport_open {
                if let Err(e) = pump(&mut engine, &mut writer, &ctx).await {
                    error!("transport write failed: {}", e);
                    transport_open = false;
                    engine.on_transport_closed();
                    failure = Some(e);
                }
            }
            publish(&mut engine, &ctx);

            if failure.is_some() || !transport_open {
                break;
            }
            if engine.is_over() {
                let now = clock();
                let since = *over_since.get_or_insert(now);
                if now.saturating_sub(since) >= linger {
                    break;
                }
            }
        }
    }

    // Teardown: nothing is sent once this starts.
    samples.close();
    engine.shutdown();
    publish(&mut engine, &ctx);
    if let Err(e) = writer.shutdown().await {
        debug!("transport shutdown: {}", e);
    }

    if let Some(e) = failure {
        return Err(e.into());
    }

    let state = engine.rally().state();
    let summary = MatchSummary {
        result: engine.result(),
        score_local: state.score_local,
        score_remote: state.score_remote,
        swings_detected: classifier.total_swings(),
        sync_stats: engine.sync().stats(),
    };
    match summary.result {
        Some(result) => info!(
            "match over: {:?} {}-{} ({} swings detected)",
            result, summary.score_local, summary.score_remote, summary.swings_detected
        ),
        None => warn!("match abandoned at {}-{}", summary.score_local, summary.score_remote),
    }
    Ok(summary)
}

/// Write pending frames, then publish pending feedback.
async fn pump<W>(engine: &mut MatchEngine, writer: &mut W, ctx: &Context) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frames = engine.drain_outgoing();
    if !frames.is_empty() {
        for frame in &frames {
            writer.write_all(frame).await?;
        }
        writer.flush().await?;
    }
    publish(engine, ctx);
    Ok(())
}

fn publish(engine: &mut MatchEngine, ctx: &Context) {
    for feedback in engine.drain_feedback() {
        ctx.publish(feedback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Feedback;
    use crate::sensor::SensorFeed;
    use crate::types::ForceTier;
    use tokio::sync::broadcast::error::RecvError;

    const GRAVITY: [f32; 3] = [0.0, 0.0, 9.81];

    fn swing_trace(start_ms: u64, peak: f32) -> Vec<MotionSample> {
        let profile = [0.0, 0.0, 0.2, 0.4, 0.7, 1.0, 0.7, 0.4, 0.2, 0.0];
        let mut samples: Vec<_> = profile
            .iter()
            .enumerate()
            .map(|(i, f)| {
                MotionSample::new(start_ms + i as u64 * 10, [peak * f, 0.0, 9.81], None, GRAVITY)
            })
            .collect();
        for i in 0..10 {
            samples.push(MotionSample::new(start_ms + 100 + i * 10, [0.0, 0.0, 9.81], None, GRAVITY));
        }
        samples
    }

    async fn next_matching<F>(rx: &mut tokio::sync::broadcast::Receiver<crate::Notification>, pred: F) -> Feedback
    where
        F: Fn(&Feedback) -> bool,
    {
        loop {
            match rx.recv().await {
                Ok(n) if pred(&n.feedback) => return n.feedback,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("feedback channel closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_hangup_ends_match() {
        let (a_io, b_io) = tokio::io::duplex(4096);
        drop(b_io);
        let (_feed, samples) = SensorFeed::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let summary = run_match(a_io, samples, Context::new(64), RallyConfig::new(), Side::Local, stop_rx)
            .await
            .unwrap();
        assert_eq!(summary.result, Some(MatchResult::ConnectionLost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (a_io, _b_io) = tokio::io::duplex(64 * 1024);
        let (_feed, samples) = SensorFeed::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let ctx = Context::new(64);
        let mut rx = ctx.subscribe();

        let config = RallyConfig::new();
        let liveness = config.sync.liveness_timeout_ms;
        let started = Instant::now();
        let summary = run_match(a_io, samples, ctx, config, Side::Local, stop_rx).await.unwrap();

        assert_eq!(summary.result, Some(MatchResult::ConnectionLost));
        assert!(started.elapsed() >= Duration::from_millis(liveness));
        let ended = next_matching(&mut rx, |f| matches!(f, Feedback::MatchEnded { .. })).await;
        assert_eq!(
            ended,
            Feedback::MatchEnded { result: MatchResult::ConnectionLost, score_local: 0, score_remote: 0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_match_and_stops_feed() {
        let (a_io, _b_io) = tokio::io::duplex(64 * 1024);
        let (feed, samples) = SensorFeed::channel(16);
        feed.start().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let session = tokio::spawn(run_match(a_io, samples, Context::new(64), RallyConfig::new(), Side::Local, stop_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.result, None);
        // The queue is closed, so the feed stops on its next push.
        assert!(!feed.push(MotionSample::new(0, [0.0; 3], None, GRAVITY)));
        assert!(!feed.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_serve_reaches_peer() {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (feed_a, samples_a) = SensorFeed::channel(64);
        let (_feed_b, samples_b) = SensorFeed::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx_b = Context::new(256);
        let mut rx_b = ctx_b.subscribe();

        let a = tokio::spawn(run_match(a_io, samples_a, Context::new(256), RallyConfig::new(), Side::Local, stop_rx.clone()));
        let b = tokio::spawn(run_match(b_io, samples_b, ctx_b, RallyConfig::new(), Side::Remote, stop_rx));

        feed_a.start().unwrap();
        for sample in swing_trace(0, 20.0) {
            assert!(feed_a.push(sample));
        }

        let seen = next_matching(&mut rx_b, |f| matches!(f, Feedback::Swing { .. })).await;
        assert_eq!(seen, Feedback::Swing { tier: ForceTier::Medium, origin: Side::Remote });

        stop_tx.send(true).unwrap();
        let summary_a = a.await.unwrap().unwrap();
        let summary_b = b.await.unwrap().unwrap();
        assert_eq!(summary_a.swings_detected, 1);
        assert_eq!(summary_b.swings_detected, 0);
    }
}
