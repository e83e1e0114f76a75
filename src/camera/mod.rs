//! Camera pipeline for video-capable intercom accessories.
//!
//! ```text
//!                 ┌────────────┐   box stream   ┌───────────┐
//!  camera ──RTSP──│ transcoder │───────────────>│ PreBuffer │
//!                 └────────────┘                └─────┬─────┘
//!                                                     │ replay (history + live)
//!                                               ┌─────▼──────────┐
//!                                               │ RecordingSession│──> HKSV packets
//!                                               └────────────────┘
//!  StreamingSession ──> SRTP live view, snapshots (cached)
//!  MotionDetector   ──> polls snapshots, emits motion on/off
//! ```
//!
//! Subprocesses are reached only through the [`transcoder::Spawner`]
//! seam; every stage above it is exercised in tests with scripted
//! processes.

pub mod boxes;
pub mod motion;
pub mod prebuffer;
pub mod recording;
pub mod streaming;
pub mod transcoder;

pub use boxes::{BoxKind, BoxReader, MediaBox};
pub use motion::{MotionDecision, MotionDetector};
pub use prebuffer::PreBuffer;
pub use recording::{RecordingConfig, RecordingPacket, RecordingSession, RecordingStream};
pub use streaming::{PrepareRequest, PrepareResponse, StreamingSession};
pub use transcoder::{FfmpegSpawner, MediaProcess, Spawner};
