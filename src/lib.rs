//! Loxone Miniserver → HomeKit bridge core.
//!
//! This library holds the two load-bearing subsystems of the bridge:
//!
//! - [`naming`]: turning the Miniserver's mutable, duplicate-prone
//!   room/control taxonomy into HomeKit-legal, session-stable, unique
//!   accessory names.
//! - [`camera`]: the intercom video pipeline — a rolling fragment
//!   prebuffer, on-demand HKSV recording streams, live SRTP viewing
//!   sessions, cached snapshots, and snapshot-derived motion events.
//!
//! The Miniserver protocol client and the HomeKit SDK are external; their
//! contracts live in [`controller`] and [`accessory`] as traits the
//! embedding plugin implements.

pub mod accessory;
pub mod camera;
pub mod config;
pub mod controller;
pub mod error;
pub mod naming;

pub use camera::{MotionDetector, PreBuffer, RecordingSession, StreamingSession};
pub use config::{CameraConfig, MotionConfig, PreBufferConfig, SnapshotConfig, StreamingConfig};
pub use error::{BridgeError, Result};
pub use naming::NameResolver;
