//! Motion estimation from polled snapshots.
//!
//! The intercom has no motion sensor; motion is derived by comparing
//! consecutive snapshots. Preferred path: pixel-level difference on a
//! downscaled grayscale decode. Fallback (decode unavailable or failed):
//! relative byte-size delta between raw JPEG buffers, bounded to reject
//! both noise and full-frame codec artifacts.
//!
//! Polling is suppressed while HKSV recording is active so snapshots do
//! not contend with the recording pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MotionConfig;

use super::streaming::StreamingSession;

/// Comparison thumbnail dimensions; coarse on purpose, motion shows up
/// at this scale while sensor noise mostly averages out.
const THUMB_W: u32 = 64;
const THUMB_H: u32 = 36;

/// Consecutive low-difference cycles on the pixel path before motion is
/// cleared early (ahead of the idle timeout).
const LOW_DIFF_STREAK: u32 = 3;

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionDecision {
    /// Motion onset detected this cycle.
    Triggered,
    /// Motion cleared this cycle.
    Cleared,
    /// No state change.
    NoChange,
}

struct GrayFrame {
    pixels: Vec<u8>,
}

/// Stateful snapshot-difference estimator.
///
/// [`evaluate`](Self::evaluate) is pure with respect to wall time (the
/// caller passes `now`), which keeps the threshold/cooldown/idle logic
/// testable without a camera or sleeps.
pub struct MotionDetector {
    config: MotionConfig,
    prev_frame: Option<GrayFrame>,
    prev_len: Option<usize>,
    last_trigger: Option<Instant>,
    last_activity: Option<Instant>,
    low_streak: u32,
    motion_on: bool,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            prev_frame: None,
            prev_len: None,
            last_trigger: None,
            last_activity: None,
            low_streak: 0,
            motion_on: false,
        }
    }

    pub fn is_motion(&self) -> bool {
        self.motion_on
    }

    /// Compare a snapshot against the previous one and update state.
    pub fn evaluate(&mut self, snapshot: &[u8], now: Instant) -> MotionDecision {
        let decision = match decode_gray(snapshot) {
            Some(frame) => {
                let decision = match self.prev_frame.as_ref() {
                    Some(prev) => {
                        let ratio = pixel_diff_ratio(&prev.pixels, &frame.pixels);
                        tracing::trace!(ratio, "pixel diff");
                        self.decide(ratio >= self.config.pixel_threshold, true, now)
                    }
                    None => MotionDecision::NoChange,
                };
                self.prev_frame = Some(frame);
                decision
            }
            None => {
                let decision = match self.prev_len {
                    Some(prev_len) if prev_len > 0 => {
                        let delta = (snapshot.len() as f64 - prev_len as f64).abs()
                            / prev_len as f64;
                        tracing::trace!(delta, "size delta fallback");
                        let active = delta >= self.config.size_delta_min
                            && delta <= self.config.size_delta_max;
                        self.decide(active, false, now)
                    }
                    _ => MotionDecision::NoChange,
                };
                self.prev_frame = None;
                decision
            }
        };
        self.prev_len = Some(snapshot.len());
        decision
    }

    /// Shared trigger/clear state machine for both comparison paths.
    ///
    /// `active` is this cycle's verdict; `pixel_path` enables the early
    /// sustained-low-difference clear (meaningless for the size heuristic).
    fn decide(&mut self, active: bool, pixel_path: bool, now: Instant) -> MotionDecision {
        if active {
            self.low_streak = 0;
            self.last_activity = Some(now);
            let in_cooldown = self
                .last_trigger
                .is_some_and(|t| now.duration_since(t) < self.config.cooldown);
            if !self.motion_on && !in_cooldown {
                self.motion_on = true;
                self.last_trigger = Some(now);
                tracing::debug!("motion triggered");
                return MotionDecision::Triggered;
            }
            return MotionDecision::NoChange;
        }

        if pixel_path {
            self.low_streak += 1;
        }
        if self.motion_on {
            let idle = self
                .last_activity
                .is_none_or(|t| now.duration_since(t) >= self.config.idle_timeout);
            let sustained_low = pixel_path && self.low_streak >= LOW_DIFF_STREAK;
            if idle || sustained_low {
                self.motion_on = false;
                tracing::debug!(idle, sustained_low, "motion cleared");
                return MotionDecision::Cleared;
            }
        }
        MotionDecision::NoChange
    }

    /// Run the polling loop on a dedicated thread.
    ///
    /// Cycles are skipped while `recording_active` is set. `on_event`
    /// receives `true` on trigger and `false` on clear.
    pub fn spawn(
        mut self,
        streaming: Arc<StreamingSession>,
        recording_active: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
        on_event: Box<dyn Fn(bool) + Send>,
    ) -> thread::JoinHandle<()> {
        let interval = self.config.poll_interval;
        thread::spawn(move || {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "motion polling started");
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if recording_active.load(Ordering::SeqCst) {
                    tracing::trace!("recording active, motion cycle skipped");
                    continue;
                }
                match streaming.snapshot() {
                    Ok(snapshot) => match self.evaluate(&snapshot, Instant::now()) {
                        MotionDecision::Triggered => on_event(true),
                        MotionDecision::Cleared => on_event(false),
                        MotionDecision::NoChange => {}
                    },
                    Err(e) => {
                        // Degrade silently: skip the cycle, keep polling.
                        tracing::debug!(error = %e, "snapshot unavailable for motion cycle");
                    }
                }
            }
            tracing::debug!("motion polling stopped");
        })
    }
}

/// Decode to a fixed-size grayscale thumbnail; `None` when the buffer is
/// not a decodable image.
fn decode_gray(data: &[u8]) -> Option<GrayFrame> {
    let img = image::load_from_memory(data).ok()?;
    let thumb = img.thumbnail_exact(THUMB_W, THUMB_H).to_luma8();
    Some(GrayFrame {
        pixels: thumb.into_raw(),
    })
}

/// Mean absolute pixel difference, normalized to 0.0..=1.0.
fn pixel_diff_ratio(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| u64::from(x.abs_diff(*y)))
        .sum();
    total as f64 / (a.len() as f64 * 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::GrayImage;

    fn config() -> MotionConfig {
        MotionConfig::default()
    }

    fn jpeg_frame(luma: u8) -> Vec<u8> {
        let img = GrayImage::from_pixel(96, 54, image::Luma([luma]));
        let mut buf = Vec::new();
        JpegEncoder::new(&mut buf)
            .encode_image(&img)
            .expect("jpeg encode");
        buf
    }

    /// Opaque bytes the decoder rejects, sized as requested.
    fn opaque(len: usize) -> Vec<u8> {
        vec![0x00; len]
    }

    // --- Pixel path ---

    #[test]
    fn pixel_change_triggers() {
        let mut detector = MotionDetector::new(config());
        let now = Instant::now();
        assert_eq!(detector.evaluate(&jpeg_frame(10), now), MotionDecision::NoChange);
        assert_eq!(
            detector.evaluate(&jpeg_frame(250), now + Duration::from_secs(1)),
            MotionDecision::Triggered
        );
        assert!(detector.is_motion());
    }

    #[test]
    fn sustained_low_difference_clears() {
        let mut detector = MotionDetector::new(config());
        let mut now = Instant::now();
        detector.evaluate(&jpeg_frame(10), now);
        now += Duration::from_secs(1);
        assert_eq!(detector.evaluate(&jpeg_frame(250), now), MotionDecision::Triggered);

        let mut cleared = false;
        for _ in 0..LOW_DIFF_STREAK {
            now += Duration::from_secs(1);
            if detector.evaluate(&jpeg_frame(250), now) == MotionDecision::Cleared {
                cleared = true;
            }
        }
        assert!(cleared, "identical frames must clear motion early");
        assert!(!detector.is_motion());
    }

    #[test]
    fn retrigger_blocked_within_cooldown() {
        let mut detector = MotionDetector::new(config());
        let mut now = Instant::now();
        detector.evaluate(&jpeg_frame(0), now);
        now += Duration::from_secs(1);
        assert_eq!(detector.evaluate(&jpeg_frame(255), now), MotionDecision::Triggered);

        // Clear quickly via sustained low difference.
        for _ in 0..LOW_DIFF_STREAK {
            now += Duration::from_millis(500);
            detector.evaluate(&jpeg_frame(255), now);
        }
        assert!(!detector.is_motion());

        // New activity inside the 8s cooldown must not retrigger.
        now += Duration::from_millis(500);
        assert_eq!(detector.evaluate(&jpeg_frame(0), now), MotionDecision::NoChange);

        // After the cooldown it does.
        now += config().cooldown;
        detector.evaluate(&jpeg_frame(0), now);
        now += Duration::from_secs(1);
        assert_eq!(detector.evaluate(&jpeg_frame(255), now), MotionDecision::Triggered);
    }

    // --- Size-delta fallback ---

    #[test]
    fn size_delta_inside_window_triggers() {
        let mut detector = MotionDetector::new(config());
        let now = Instant::now();
        detector.evaluate(&opaque(10_000), now);
        // +10% is inside the 4%..30% window.
        assert_eq!(
            detector.evaluate(&opaque(11_000), now + Duration::from_secs(1)),
            MotionDecision::Triggered
        );
    }

    #[test]
    fn negligible_size_delta_is_noise() {
        let mut detector = MotionDetector::new(config());
        let now = Instant::now();
        detector.evaluate(&opaque(10_000), now);
        assert_eq!(
            detector.evaluate(&opaque(10_100), now + Duration::from_secs(1)),
            MotionDecision::NoChange
        );
    }

    #[test]
    fn huge_size_delta_is_rejected_as_artifact() {
        let mut detector = MotionDetector::new(config());
        let now = Instant::now();
        detector.evaluate(&opaque(10_000), now);
        // +80% looks like a codec artifact or failed frame, not motion.
        assert_eq!(
            detector.evaluate(&opaque(18_000), now + Duration::from_secs(1)),
            MotionDecision::NoChange
        );
    }

    #[test]
    fn idle_timeout_clears_fallback_motion() {
        let mut detector = MotionDetector::new(config());
        let mut now = Instant::now();
        detector.evaluate(&opaque(10_000), now);
        now += Duration::from_secs(1);
        assert_eq!(detector.evaluate(&opaque(11_000), now), MotionDecision::Triggered);

        // Quiet cycles until past the idle timeout.
        now += config().idle_timeout + Duration::from_secs(1);
        assert_eq!(detector.evaluate(&opaque(11_000), now), MotionDecision::Cleared);
        assert!(!detector.is_motion());
    }
}
