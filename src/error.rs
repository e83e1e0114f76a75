//! Error types for the bridge library.

use std::fmt;

/// Errors that can occur across the bridge.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/pipe/subprocess I/O failures.
/// - **Framing**: [`Framing`](Self::Framing) — malformed length-prefixed
///   box streams from a transcoder.
/// - **Sessions**: [`SessionNotFound`](Self::SessionNotFound),
///   [`RecordingNotConfigured`](Self::RecordingNotConfigured),
///   [`BufferNotRunning`](Self::BufferNotRunning).
/// - **Subprocess**: [`SpawnFailed`](Self::SpawnFailed).
/// - **Controller**: [`CommandRejected`](Self::CommandRejected),
///   [`UnsupportedControl`](Self::UnsupportedControl).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Underlying I/O, socket, or pipe error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed length-prefixed box stream from a transcoder.
    ///
    /// Terminal for the reader that hit it; consumers observe end-of-stream.
    #[error("box framing error: {kind}")]
    Framing { kind: FramingErrorKind },

    /// No live-streaming session with the given ID has been prepared.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A recording stream was requested before the host negotiated a
    /// recording configuration.
    #[error("recording not configured")]
    RecordingNotConfigured,

    /// Replay was requested from a prebuffer that never started and holds
    /// no fragments.
    #[error("prebuffer not running")]
    BufferNotRunning,

    /// The transcoder subprocess could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// UDP port reservation exhausted its retry budget.
    #[error("unable to reserve UDP ports")]
    PortReservationFailed,

    /// The controller reported a type tag outside the supported set.
    #[error("unsupported control type: {0}")]
    UnsupportedControl(String),

    /// The controller refused a command (non-200 status code).
    #[error("command rejected by controller (code {0})")]
    CommandRejected(u16),
}

/// Specific kind of box-framing failure.
#[derive(Debug, PartialEq, Eq)]
pub enum FramingErrorKind {
    /// Stream ended inside an 8-byte box header.
    TruncatedHeader,
    /// Stream ended inside a box payload.
    TruncatedPayload,
    /// Declared box length smaller than the 8-byte header.
    LengthTooSmall,
    /// Declared box length above the sanity cap.
    LengthTooLarge,
}

impl fmt::Display for FramingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader => write!(f, "truncated box header"),
            Self::TruncatedPayload => write!(f, "truncated box payload"),
            Self::LengthTooSmall => write!(f, "declared length below header size"),
            Self::LengthTooLarge => write!(f, "declared length above sanity cap"),
        }
    }
}

/// Convenience alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
