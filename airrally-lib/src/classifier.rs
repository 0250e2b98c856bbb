//! Swing detection on the raw motion stream.
//!
//! A swing starts when gravity-compensated acceleration crosses
//! [`ONSET_THRESHOLD`] from below. Samples are then collected until the peak
//! is confirmed (no new maximum for `lookahead_samples` samples, or the
//! gesture window runs out) and the event is built from the peak sample, so
//! force reflects the whole gesture rather than its leading edge. A refractory
//! period after each peak keeps sensor ringing from firing a second event.

use futures::{Stream, StreamExt, future};
use log::{debug, trace};

use crate::types::{ForceTier, MotionSample, SPIN_FULL_SCALE, SwingEvent, ONSET_THRESHOLD};

/// Tunables for the classifier. Force thresholds are deliberately not here:
/// they are shared constants in [`crate::types`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Samples without a new maximum before the peak is accepted.
    pub lookahead_samples: usize,
    /// Longest gesture, measured from onset, before it is finalized anyway.
    pub max_window_ms: u64,
    /// Quiet period after a peak during which no onset is accepted.
    pub refractory_ms: u64,
    /// Sample gap that finalizes an in-progress gesture with what it has.
    pub idle_timeout_ms: u64,
    /// Upper bound on samples buffered for one gesture.
    pub window_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            lookahead_samples: 5,
            max_window_ms: 250,
            refractory_ms: 300,
            idle_timeout_ms: 100,
            window_capacity: 64,
        }
    }
}

/// Gesture being tracked between onset and peak confirmation.
#[derive(Debug)]
struct Gesture {
    onset_ms: u64,
    window: Vec<(MotionSample, f32)>,
    peak_idx: usize,
    since_peak: usize,
    last_ms: u64,
}

impl Gesture {
    fn start(sample: &MotionSample, magnitude: f32, capacity: usize) -> Self {
        let mut window = Vec::with_capacity(capacity);
        window.push((*sample, magnitude));
        Self {
            onset_ms: sample.timestamp_ms,
            window,
            peak_idx: 0,
            since_peak: 0,
            last_ms: sample.timestamp_ms,
        }
    }

    fn push(&mut self, sample: &MotionSample, magnitude: f32) {
        self.last_ms = sample.timestamp_ms;
        self.window.push((*sample, magnitude));
        if magnitude > self.window[self.peak_idx].1 {
            self.peak_idx = self.window.len() - 1;
            self.since_peak = 0;
        } else {
            self.since_peak += 1;
        }
    }

    fn peak(&self) -> (MotionSample, f32) {
        self.window[self.peak_idx]
    }
}

/// Turns motion samples into [`SwingEvent`]s, one sample at a time.
pub struct SwingClassifier {
    config: ClassifierConfig,
    gesture: Option<Gesture>,
    /// True once magnitude has been below onset, so the next crossing is a rising edge.
    armed: bool,
    refractory_until: Option<u64>,
    last_sample_ms: Option<u64>,
    last_event_ms: Option<u64>,
    total_swings: u64,
}

impl SwingClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            gesture: None,
            armed: false,
            refractory_until: None,
            last_sample_ms: None,
            last_event_ms: None,
            total_swings: 0,
        }
    }

    /// Feed one sample. Returns a swing when this sample completes one.
    pub fn classify(&mut self, sample: &MotionSample) -> Option<SwingEvent> {
        if let Some(prev) = self.last_sample_ms {
            if sample.timestamp_ms <= prev {
                trace!("dropping out-of-order sample at {} ms", sample.timestamp_ms);
                return None;
            }
        }
        let after_gap = self
            .last_sample_ms
            .is_some_and(|prev| sample.timestamp_ms - prev > self.config.idle_timeout_ms);
        self.last_sample_ms = Some(sample.timestamp_ms);
        let magnitude = sample.linear_magnitude();

        let mut finalized = None;
        if let Some(gesture) = self.gesture.as_mut() {
            if after_gap {
                debug!(
                    "sensor gap of {} ms mid-swing, finalizing from partial data",
                    sample.timestamp_ms - gesture.last_ms
                );
                finalized = self.finalize();
            } else {
                return self.extend_gesture(sample, magnitude);
            }
        }

        // A gap counts as quiet: the first sample after it may be an onset.
        if after_gap {
            self.armed = true;
        }
        let refractory = self
            .refractory_until
            .is_some_and(|until| sample.timestamp_ms < until);
        if !refractory && self.armed && magnitude >= ONSET_THRESHOLD {
            trace!("swing onset at {} ms ({:.1} m/s²)", sample.timestamp_ms, magnitude);
            self.gesture = Some(Gesture::start(sample, magnitude, self.config.window_capacity));
            self.armed = false;
            return finalized;
        }

        self.armed = magnitude < ONSET_THRESHOLD;
        finalized
    }

    fn extend_gesture(&mut self, sample: &MotionSample, magnitude: f32) -> Option<SwingEvent> {
        if let Some(gesture) = self.gesture.as_mut() {
            gesture.push(sample, magnitude);
            let done = gesture.since_peak >= self.config.lookahead_samples
                || sample.timestamp_ms.saturating_sub(gesture.onset_ms) >= self.config.max_window_ms
                || gesture.window.len() >= self.config.window_capacity;
            if done {
                let event = self.finalize();
                self.armed = magnitude < ONSET_THRESHOLD;
                return event;
            }
        }
        None
    }

    /// Feed a batch and collect every swing it completes.
    pub fn classify_batch(&mut self, samples: &[MotionSample]) -> Vec<SwingEvent> {
        samples.iter().filter_map(|s| self.classify(s)).collect()
    }

    /// Finalize an in-progress gesture when the sample stream has stalled.
    /// Returns `None` when nothing is in progress.
    pub fn flush_stalled(&mut self) -> Option<SwingEvent> {
        if self.gesture.is_some() {
            debug!("sample stream stalled mid-swing, finalizing");
        }
        self.finalize()
    }

    /// True between onset and finalization.
    pub fn in_progress(&self) -> bool {
        self.gesture.is_some()
    }

    pub fn total_swings(&self) -> u64 {
        self.total_swings
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Forget any in-progress gesture and timing state.
    pub fn reset(&mut self) {
        self.gesture = None;
        self.armed = false;
        self.refractory_until = None;
        self.last_sample_ms = None;
    }

    fn finalize(&mut self) -> Option<SwingEvent> {
        let gesture = self.gesture.take()?;
        let (peak, magnitude) = gesture.peak();
        self.refractory_until = Some(peak.timestamp_ms + self.config.refractory_ms);

        // Event timestamps must strictly increase even if a peak repeats a timestamp.
        let timestamp_ms = match self.last_event_ms {
            Some(last) if peak.timestamp_ms <= last => last + 1,
            _ => peak.timestamp_ms,
        };
        self.last_event_ms = Some(timestamp_ms);
        self.total_swings += 1;

        let event = SwingEvent::new(
            timestamp_ms,
            ForceTier::from_magnitude(magnitude),
            direction_at(&peak),
            spin_at(&peak),
        );
        debug!(
            "swing at {} ms: {:?} ({:.1} m/s², {:.0}°, spin {:.2})",
            event.timestamp_ms,
            event.force,
            magnitude,
            event.angle_deg(),
            event.spin
        );
        Some(event)
    }
}

impl Default for SwingClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

fn direction_at(peak: &MotionSample) -> [f32; 2] {
    let [x, y, _] = peak.linear_accel();
    let norm = (x * x + y * y).sqrt();
    if norm < 1e-3 {
        return [1.0, 0.0];
    }
    [x / norm, y / norm]
}

fn spin_at(peak: &MotionSample) -> f32 {
    peak.gyro
        .map(|g| (g[2] / SPIN_FULL_SCALE).clamp(-1.0, 1.0))
        .unwrap_or(0.0)
}

/// Lazily classify an iterator of samples.
pub fn swings_from_iter<I>(samples: I, mut classifier: SwingClassifier) -> impl Iterator<Item = SwingEvent>
where
    I: IntoIterator<Item = MotionSample>,
{
    samples.into_iter().filter_map(move |s| classifier.classify(&s))
}

/// Lazily classify a stream of samples.
pub fn swing_stream<S>(samples: S, classifier: SwingClassifier) -> impl Stream<Item = SwingEvent>
where
    S: Stream<Item = MotionSample>,
{
    samples
        .scan(classifier, |classifier, sample| future::ready(Some(classifier.classify(&sample))))
        .filter_map(future::ready)
}
