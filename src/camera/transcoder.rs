//! Transcoder subprocess boundary.
//!
//! The pipeline depends on exactly three things from the transcoder
//! (ffmpeg in practice): a length-prefixed box stream on stdout, a
//! non-zero exit for failure, and stderr lines for diagnostics only.
//! Everything else — spawn, graceful-then-forced termination, stderr
//! draining — lives behind the [`Spawner`]/[`MediaProcess`] traits so
//! tests can substitute scripted processes.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::config::{CameraConfig, SourceAuth};
use crate::error::{BridgeError, Result};

/// Poll step while waiting out the kill grace window.
const STOP_POLL_STEP: Duration = Duration::from_millis(50);

/// A running transcoder instance.
pub trait MediaProcess: Send {
    /// Take ownership of the stdout pipe. Returns `None` after the first
    /// call or when the process was spawned without one.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Take ownership of the stdin pipe (used to feed replay fragments to
    /// a repackager).
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Whether the process is still alive.
    fn is_running(&mut self) -> bool;

    /// Terminate: graceful first (quit command + stdin close), then a
    /// forced kill once `grace` has elapsed. Idempotent.
    fn stop(&mut self, grace: Duration);
}

/// Factory for transcoder processes.
pub trait Spawner: Send + Sync {
    fn spawn(&self, args: &[String]) -> Result<Box<dyn MediaProcess>>;
}

/// Real spawner shelling out to an ffmpeg-compatible binary.
///
/// stderr is drained on a detached thread so the child never blocks on a
/// full pipe; lines matching the error-keyword heuristic log at warn,
/// the rest at debug.
pub struct FfmpegSpawner {
    program: String,
}

impl FfmpegSpawner {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl Spawner for FfmpegSpawner {
    fn spawn(&self, args: &[String]) -> Result<Box<dyn MediaProcess>> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        tracing::debug!(program = %self.program, pid = child.id(), "transcoder spawned");

        if let Some(stderr) = child.stderr.take() {
            let program = self.program.clone();
            let pid = child.id();
            thread::spawn(move || drain_stderr(stderr, &program, pid));
        }

        Ok(Box::new(FfmpegProcess {
            child,
            program: self.program.clone(),
        }))
    }
}

struct FfmpegProcess {
    child: Child,
    program: String,
}

impl MediaProcess for FfmpegProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(&mut self, grace: Duration) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                log_exit(&self.program, self.child.id(), status.code());
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "try_wait failed");
            }
        }

        // ffmpeg exits on 'q'; closing stdin covers transcoders that
        // stop at input EOF instead.
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q");
            let _ = stdin.flush();
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log_exit(&self.program, self.child.id(), status.code());
                    return;
                }
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => thread::sleep(STOP_POLL_STEP),
                Err(_) => break,
            }
        }

        tracing::warn!(
            program = %self.program,
            pid = self.child.id(),
            grace_ms = grace.as_millis() as u64,
            "grace window elapsed, force-killing transcoder"
        );
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        // Last-resort cleanup so a dropped handle never orphans a child.
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn log_exit(program: &str, pid: u32, code: Option<i32>) {
    match code {
        Some(0) => tracing::debug!(program, pid, "transcoder exited cleanly"),
        Some(code) => tracing::warn!(program, pid, code, "transcoder exited with error"),
        None => tracing::warn!(program, pid, "transcoder terminated by signal"),
    }
}

/// Whether a stderr line looks like a failure report.
///
/// Diagnostic only — stderr never drives control decisions.
fn line_is_noisy(line: &str) -> bool {
    let lower = line.to_lowercase();
    ["error", "fail", "unable", "invalid", "denied"]
        .iter()
        .any(|kw| lower.contains(kw))
}

fn drain_stderr<R: Read>(stderr: R, program: &str, pid: u32) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if line_is_noisy(&line) => {
                tracing::warn!(program, pid, line = %line, "transcoder stderr");
            }
            Ok(line) => {
                tracing::debug!(program, pid, line = %line, "transcoder stderr");
            }
            Err(_) => break,
        }
    }
    tracing::trace!(program, pid, "stderr drained");
}

// --- Argument builders ---
//
// Each builder produces a full argv (without the program name). Authentication
// is injected as a Basic header; SRTP material is passed base64-encoded the
// way ffmpeg expects it.

/// `-headers` argument pair carrying Basic auth, when credentials exist.
pub fn auth_args(auth: Option<&SourceAuth>) -> Vec<String> {
    match auth {
        Some(auth) => {
            let token = BASE64_STANDARD.encode(format!("{}:{}", auth.user, auth.password));
            vec![
                "-headers".to_string(),
                format!("Authorization: Basic {token}\r\n"),
            ]
        }
        None => Vec::new(),
    }
}

/// Arguments for the prebuffer producer: copy the source into a
/// fragmented-MP4 box stream on stdout.
pub fn prebuffer_args(cfg: &CameraConfig) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-nostats".to_string()];
    args.extend(auth_args(cfg.auth.as_ref()));
    args.extend(
        [
            "-i",
            &cfg.source_url,
            "-c:v",
            "copy",
            "-c:a",
            "copy",
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

/// Arguments for the recording repackager: read buffered+live fragments
/// from stdin, re-fragment at the negotiated duration, box stream on stdout.
pub fn record_args(fragment_duration: Duration) -> Vec<String> {
    [
        "-hide_banner",
        "-nostats",
        "-f",
        "mp4",
        "-i",
        "pipe:0",
        "-c:v",
        "copy",
        "-c:a",
        "copy",
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+empty_moov+default_base_moof",
        "-min_frag_duration",
        &format!("{}", fragment_duration.as_micros()),
        "pipe:1",
    ]
    .map(String::from)
    .to_vec()
}

/// Arguments for a one-shot snapshot: exactly one JPEG frame on stdout.
pub fn snapshot_args(cfg: &CameraConfig) -> Vec<String> {
    let url = cfg.snapshot_url.as_deref().unwrap_or(&cfg.source_url);
    let mut args = vec!["-hide_banner".to_string(), "-nostats".to_string()];
    args.extend(auth_args(cfg.auth.as_ref()));
    args.extend(
        ["-i", url, "-frames:v", "1", "-f", "image2", "pipe:1"].map(String::from),
    );
    args
}

/// SRTP endpoint parameters for a live viewer stream.
#[derive(Debug, Clone)]
pub struct SrtpEndpoint {
    pub address: String,
    pub port: u16,
    pub ssrc: u32,
    /// 16-byte AES key followed by 14-byte salt.
    pub key_salt: Vec<u8>,
}

/// Arguments for the live-view transcoder pushing SRTP to the viewer.
/// Audio is disabled (`-an`); live sessions carry video only.
pub fn live_args(cfg: &CameraConfig, video: &SrtpEndpoint) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-nostats".to_string()];
    args.extend(auth_args(cfg.auth.as_ref()));
    args.extend(
        [
            "-i",
            &cfg.source_url,
            "-an",
            "-c:v",
            "copy",
            "-payload_type",
            "99",
            "-ssrc",
            &video.ssrc.to_string(),
            "-f",
            "rtp",
            "-srtp_out_suite",
            "AES_CM_128_HMAC_SHA1_80",
            "-srtp_out_params",
            &BASE64_STANDARD.encode(&video.key_salt),
            &format!("srtp://{}:{}?rtcpport={}", video.address, video.port, video.port),
        ]
        .map(String::from),
    );
    args
}
