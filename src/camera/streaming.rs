//! Live viewing sessions and snapshots.
//!
//! ## Session lifecycle
//!
//! ```text
//! prepare -> Pending  (UDP return ports reserved, SSRCs + SRTP material stored)
//! start   -> Active   (transcoder pushing SRTP, liveness monitor running)
//! stop    -> (removed; also triggered server-side on RTCP silence)
//! ```
//!
//! `stop` is idempotent — unknown and already-stopped session ids are
//! no-ops, because teardown races between host-initiated stops and the
//! inactivity watchdog are routine, not errors.
//!
//! Streaming is video-only. The audio return port and SSRC are still
//! reserved and answered so the negotiation completes, but the live
//! transcoder runs with audio disabled and no audio SRTP material is
//! requested from the host.
//!
//! ## Snapshots
//!
//! A single-slot JPEG cache with a 5 s TTL. Cache misses refresh through
//! a one-shot transcoder run under a single-flight lock, so concurrent
//! missing callers cost one subprocess, not one each.

use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashMap;
use std::io::Read;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{CameraConfig, StreamingConfig};
use crate::error::{BridgeError, Result};

use super::transcoder::{MediaProcess, Spawner, SrtpEndpoint, live_args, snapshot_args};

/// Read timeout on the liveness socket; bounds watchdog reaction time.
const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Host-negotiated parameters for one live session.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub session_id: String,
    /// Viewer address to push SRTP to.
    pub viewer_address: String,
    pub viewer_video_port: u16,
    pub viewer_audio_port: u16,
    /// SRTP key+salt for the video stream (from the host's setup message).
    pub video_key_salt: Vec<u8>,
}

/// Server-side parameters returned to the host.
#[derive(Debug, Clone)]
pub struct PrepareResponse {
    /// Local return port for video RTP/RTCP (liveness monitoring).
    pub local_video_port: u16,
    pub local_audio_port: u16,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
}

struct PendingSession {
    request: PrepareRequest,
    video_socket: UdpSocket,
    /// Held to keep the port reserved for the session's lifetime.
    audio_socket: UdpSocket,
    video_ssrc: u32,
    audio_ssrc: u32,
}

struct ActiveSession {
    process: Box<dyn MediaProcess>,
    stop_flag: Arc<AtomicBool>,
    /// Keeps the audio return port reserved while active.
    _audio_socket: UdpSocket,
}

enum LiveSession {
    Pending(PendingSession),
    Active(ActiveSession),
}

#[derive(Default)]
struct SnapshotSlot {
    data: Vec<u8>,
    captured_at: Option<Instant>,
}

/// Live streaming and snapshot orchestrator for one camera.
pub struct StreamingSession {
    camera: CameraConfig,
    streaming: StreamingConfig,
    spawner: Arc<dyn Spawner>,
    sessions: Mutex<HashMap<String, LiveSession>>,
    snapshot_slot: Mutex<SnapshotSlot>,
    /// Single-flight guard for cache refreshes.
    fetch_lock: Mutex<()>,
}

impl StreamingSession {
    pub fn new(
        camera: CameraConfig,
        streaming: StreamingConfig,
        spawner: Arc<dyn Spawner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera,
            streaming,
            spawner,
            sessions: Mutex::new(HashMap::new()),
            snapshot_slot: Mutex::new(SnapshotSlot::default()),
            fetch_lock: Mutex::new(()),
        })
    }

    /// Reserve local return ports and session identifiers; no subprocess
    /// is started yet.
    pub fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse> {
        let video_socket = bind_udp(self.streaming.bind_attempts)?;
        let audio_socket = bind_udp(self.streaming.bind_attempts)?;
        let local_video_port = video_socket.local_addr()?.port();
        let local_audio_port = audio_socket.local_addr()?.port();

        let mut rng = rand::rng();
        let video_ssrc: u32 = rng.random();
        let audio_ssrc: u32 = rng.random();

        let session_id = request.session_id.clone();
        let pending = PendingSession {
            request,
            video_socket,
            audio_socket,
            video_ssrc,
            audio_ssrc,
        };
        if self
            .sessions
            .lock()
            .insert(session_id.clone(), LiveSession::Pending(pending))
            .is_some()
        {
            tracing::warn!(session_id = %session_id, "prepare replaced an existing session");
        }

        tracing::debug!(
            session_id = %session_id,
            local_video_port,
            local_audio_port,
            "session prepared"
        );

        Ok(PrepareResponse {
            local_video_port,
            local_audio_port,
            video_ssrc,
            audio_ssrc,
        })
    }

    /// Start the transcoder for a prepared session.
    ///
    /// Unknown ids are a caller error ([`BridgeError::SessionNotFound`]);
    /// starting an already-active session is a no-op.
    pub fn start(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let pending = match sessions.remove(session_id) {
            Some(LiveSession::Pending(p)) => p,
            Some(active @ LiveSession::Active(_)) => {
                sessions.insert(session_id.to_string(), active);
                tracing::debug!(session_id, "start for already-active session, ignoring");
                return Ok(());
            }
            None => return Err(BridgeError::SessionNotFound(session_id.to_string())),
        };

        let endpoint = SrtpEndpoint {
            address: pending.request.viewer_address.clone(),
            port: pending.request.viewer_video_port,
            ssrc: pending.video_ssrc,
            key_salt: pending.request.video_key_salt.clone(),
        };
        let process = match self.spawner.spawn(&live_args(&self.camera, &endpoint)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "live transcoder spawn failed");
                return Err(e);
            }
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let inactivity = self.streaming.rtcp_interval * self.streaming.inactivity_multiplier;
        {
            let this = Arc::clone(self);
            let socket = pending.video_socket;
            let flag = Arc::clone(&stop_flag);
            let id = session_id.to_string();
            thread::spawn(move || liveness_monitor(this, id, socket, flag, inactivity));
        }

        sessions.insert(
            session_id.to_string(),
            LiveSession::Active(ActiveSession {
                process,
                stop_flag,
                _audio_socket: pending.audio_socket,
            }),
        );
        tracing::info!(
            session_id,
            viewer = %pending.request.viewer_address,
            "live session started"
        );
        Ok(())
    }

    /// Tear a session down: watchdog cleared, sockets closed, transcoder
    /// terminated. Safe on unknown or already-stopped ids.
    pub fn stop(&self, session_id: &str) {
        let removed = self.sessions.lock().remove(session_id);
        match removed {
            Some(LiveSession::Active(mut active)) => {
                active.stop_flag.store(true, Ordering::SeqCst);
                active.process.stop(self.camera.kill_grace);
                tracing::info!(session_id, "live session stopped");
            }
            Some(LiveSession::Pending(_)) => {
                // Sockets drop here, releasing the reserved ports.
                tracing::debug!(session_id, "pending session discarded");
            }
            None => {
                tracing::debug!(session_id, "stop for unknown session, ignoring");
            }
        }
    }

    /// Number of sessions in any non-terminal state.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Current snapshot JPEG, served from cache while fresh.
    ///
    /// A miss runs a one-shot transcoder under the single-flight lock;
    /// a caller that lost the race re-checks the cache instead of
    /// spawning again. Transient fetch failures retry up to the
    /// configured attempt budget.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        if let Some(cached) = self.cached_snapshot() {
            return Ok(cached);
        }

        let _flight = self.fetch_lock.lock();
        // The winner of the race may have refreshed the cache already.
        if let Some(cached) = self.cached_snapshot() {
            return Ok(cached);
        }

        let mut last_err: Option<BridgeError> = None;
        for attempt in 1..=self.camera.snapshot.attempts {
            match self.fetch_snapshot() {
                Ok(data) => {
                    let mut slot = self.snapshot_slot.lock();
                    slot.data = data.clone();
                    slot.captured_at = Some(Instant::now());
                    return Ok(data);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "snapshot fetch failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(BridgeError::Io(std::io::Error::other("snapshot unavailable"))))
    }

    fn cached_snapshot(&self) -> Option<Vec<u8>> {
        let slot = self.snapshot_slot.lock();
        let captured_at = slot.captured_at?;
        if captured_at.elapsed() < self.camera.snapshot.ttl {
            Some(slot.data.clone())
        } else {
            None
        }
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let mut process = self.spawner.spawn(&snapshot_args(&self.camera))?;
        let Some(mut stdout) = process.take_stdout() else {
            return Err(BridgeError::Io(std::io::Error::other(
                "snapshot transcoder has no stdout",
            )));
        };

        let mut data = Vec::new();
        stdout.read_to_end(&mut data)?;
        process.stop(self.camera.kill_grace);

        if data.is_empty() {
            return Err(BridgeError::Io(std::io::Error::other(
                "snapshot transcoder produced no output",
            )));
        }
        tracing::debug!(bytes = data.len(), "snapshot captured");
        Ok(data)
    }
}

/// Reserve an ephemeral UDP port, retrying transient bind failures.
fn bind_udp(attempts: u32) -> Result<UdpSocket> {
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "UDP bind failed");
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(BridgeError::Io(e)),
        None => Err(BridgeError::PortReservationFailed),
    }
}

/// Watch the RTCP return socket; force-stop the session server-side after
/// `inactivity` without traffic.
fn liveness_monitor(
    session: Arc<StreamingSession>,
    session_id: String,
    socket: UdpSocket,
    stop_flag: Arc<AtomicBool>,
    inactivity: Duration,
) {
    if socket.set_read_timeout(Some(LIVENESS_POLL)).is_err() {
        tracing::warn!(session_id = %session_id, "liveness socket timeout unsupported, monitor disabled");
        return;
    }

    let mut buf = [0u8; 1500];
    let mut last_seen = Instant::now();
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok(_) => last_seen = Instant::now(),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if last_seen.elapsed() > inactivity {
                    tracing::warn!(
                        session_id = %session_id,
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "no RTCP traffic, force-stopping session"
                    );
                    session.stop(&session_id);
                    break;
                }
            }
            Err(_) => break,
        }
    }
    tracing::trace!(session_id = %session_id, "liveness monitor ended");
}
