//! Camera pipeline configuration.
//!
//! Plain structs with `Default` impls carrying the design defaults; the
//! embedding host (or the CLI) overrides fields as needed.

use std::time::Duration;

/// Source-side credentials injected into transcoder arguments as a
/// Basic-auth header.
#[derive(Debug, Clone)]
pub struct SourceAuth {
    pub user: String,
    pub password: String,
}

/// Configuration for one camera-bearing accessory.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Source stream URL (typically the intercom's RTSP/HTTP endpoint).
    pub source_url: String,
    /// Still-image URL for snapshots; falls back to `source_url` when unset.
    pub snapshot_url: Option<String>,
    /// Credentials for the source, if it requires authentication.
    pub auth: Option<SourceAuth>,
    /// Transcoder binary name or path.
    pub transcoder: String,
    pub prebuffer: PreBufferConfig,
    pub snapshot: SnapshotConfig,
    pub motion: MotionConfig,
    /// Grace window before a stopping subprocess is force-killed.
    pub kill_grace: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            snapshot_url: None,
            auth: None,
            transcoder: "ffmpeg".to_string(),
            prebuffer: PreBufferConfig::default(),
            snapshot: SnapshotConfig::default(),
            motion: MotionConfig::default(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Bounds for the rolling fragment prebuffer.
#[derive(Debug, Clone)]
pub struct PreBufferConfig {
    /// Fragments older than this are evicted (time bound).
    pub retention: Duration,
    /// Hard cap on retained fragments (memory bound under pathological
    /// high-rate input; enforced after the time bound).
    pub max_fragments: usize,
    /// A replay tap that nobody closes is cut after this long.
    pub replay_timeout: Duration,
}

impl Default for PreBufferConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_millis(15_000),
            max_fragments: 240,
            replay_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot cache behavior.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Cached JPEG is served while younger than this.
    pub ttl: Duration,
    /// Attempts per fetch; transient failures retry up to this count.
    pub attempts: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            attempts: 2,
        }
    }
}

/// Motion-estimation thresholds.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Snapshot polling cadence.
    pub poll_interval: Duration,
    /// Pixel-difference ratio above which motion triggers.
    pub pixel_threshold: f64,
    /// Minimum gap between two motion triggers.
    pub cooldown: Duration,
    /// Motion clears after this long without a trigger.
    pub idle_timeout: Duration,
    /// Size-delta fallback window: ratios inside trigger, outside are
    /// treated as noise (low end) or codec artifacts (high end).
    pub size_delta_min: f64,
    pub size_delta_max: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            pixel_threshold: 0.04,
            cooldown: Duration::from_millis(8000),
            idle_timeout: Duration::from_millis(15_000),
            size_delta_min: 0.04,
            size_delta_max: 0.30,
        }
    }
}

/// Live-streaming session parameters.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// RTCP keepalive interval negotiated with the host.
    pub rtcp_interval: Duration,
    /// Session is force-stopped after this many silent intervals.
    pub inactivity_multiplier: u32,
    /// UDP bind attempts before giving up port reservation.
    pub bind_attempts: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            rtcp_interval: Duration::from_secs(5),
            inactivity_multiplier: 5,
            bind_attempts: 8,
        }
    }
}
