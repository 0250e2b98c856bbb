//! Motion sample sources feeding a match session.
//!
//! The session consumes a bounded `mpsc` queue. Producers hold a
//! [`SensorFeed`], which gates pushes on an explicit start/stop lifecycle and
//! never blocks: when the queue is full the sample is dropped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::error::SensorError;
use crate::types::MotionSample;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Producer half of the sample queue. Clones share one lifecycle.
#[derive(Clone, Debug)]
pub struct SensorFeed {
    tx: Sender<MotionSample>,
    state: Arc<AtomicU8>,
}

impl SensorFeed {
    /// Create a feed and the receiver the session drains.
    pub fn channel(capacity: usize) -> (SensorFeed, Receiver<MotionSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        let feed = SensorFeed { tx, state: Arc::new(AtomicU8::new(IDLE)) };
        (feed, rx)
    }

    /// Begin accepting samples. A stopped feed cannot be restarted.
    pub fn start(&self) -> Result<(), SensorError> {
        match self.state.compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                info!("sensor feed started");
                Ok(())
            }
            Err(RUNNING) => Ok(()),
            Err(_) => Err(SensorError::Stopped),
        }
    }

    /// Stop accepting samples. Safe to call any number of times.
    pub fn stop(&self) {
        if self.state.swap(STOPPED, Ordering::AcqRel) != STOPPED {
            info!("sensor feed stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Offer one sample. Returns false if it was not queued: the feed is not
    /// running, the queue is full, or the session has gone away.
    pub fn push(&self, sample: MotionSample) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("sample queue full, dropping sample at {} ms", sample.timestamp_ms);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stop();
                false
            }
        }
    }
}

/// Replays a JSON-lines recording into `feed`, one [`MotionSample`] per line,
/// sleeping between samples so they arrive at their recorded pace. Blank lines
/// are skipped. Returns the number of samples queued.
pub fn run_replay_blocking(feed: SensorFeed, path: impl AsRef<Path>) -> Result<usize, SensorError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    feed.start()?;
    info!("replaying motion samples from {}", path.display());

    let mut previous: Option<u64> = None;
    let mut queued = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: MotionSample = serde_json::from_str(&line)
            .map_err(|source| SensorError::Parse { line: idx + 1, source })?;

        if let Some(prev) = previous {
            let gap = sample.timestamp_ms.saturating_sub(prev);
            if gap > 0 {
                sleep(Duration::from_millis(gap));
            }
        }
        previous = Some(sample.timestamp_ms);

        if !feed.is_running() {
            warn!("replay interrupted after {} samples", queued);
            break;
        }
        if feed.push(sample) {
            queued += 1;
        }
    }
    info!("replay finished, {} samples queued", queued);
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn at(t: u64) -> MotionSample {
        MotionSample::new(t, [0.0, 0.0, 9.81], None, [0.0, 0.0, 9.81])
    }

    #[test]
    fn test_push_requires_start() {
        let (feed, mut rx) = SensorFeed::channel(4);
        assert!(!feed.push(at(0)));
        feed.start().unwrap();
        assert!(feed.push(at(10)));
        assert_eq!(rx.try_recv().unwrap().timestamp_ms, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let (feed, _rx) = SensorFeed::channel(4);
        feed.start().unwrap();
        feed.stop();
        feed.stop();
        assert!(!feed.is_running());
        assert!(!feed.push(at(0)));
        assert!(matches!(feed.start(), Err(SensorError::Stopped)));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (feed, _rx) = SensorFeed::channel(2);
        feed.start().unwrap();
        assert!(feed.push(at(0)));
        assert!(feed.push(at(10)));
        assert!(!feed.push(at(20)));
        assert!(feed.is_running());
    }

    #[test]
    fn test_closed_receiver_stops_feed() {
        let (feed, rx) = SensorFeed::channel(2);
        feed.start().unwrap();
        drop(rx);
        assert!(!feed.push(at(0)));
        assert!(!feed.is_running());
    }

    #[test]
    fn test_replay_reads_json_lines() {
        let path = std::env::temp_dir().join(format!("airrally-replay-{}.jsonl", std::process::id()));
        {
            let mut file = File::create(&path).unwrap();
            for t in [0u64, 2, 4] {
                writeln!(file, "{}", serde_json::to_string(&at(t)).unwrap()).unwrap();
            }
            writeln!(file).unwrap();
        }

        let (feed, mut rx) = SensorFeed::channel(8);
        let queued = run_replay_blocking(feed, &path).unwrap();
        assert_eq!(queued, 3);
        let stamps: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|s| s.timestamp_ms).collect();
        assert_eq!(stamps, vec![0, 2, 4]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_replay_reports_bad_line() {
        let path = std::env::temp_dir().join(format!("airrally-bad-{}.jsonl", std::process::id()));
        std::fs::write(&path, format!("{}\nnot json\n", serde_json::to_string(&at(0)).unwrap())).unwrap();

        let (feed, _rx) = SensorFeed::channel(8);
        let err = run_replay_blocking(feed, &path).unwrap_err();
        assert!(matches!(err, SensorError::Parse { line: 2, .. }));
        std::fs::remove_file(&path).ok();
    }
}
