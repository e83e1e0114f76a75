//! On-demand recording sessions (HKSV).
//!
//! Each recording request gets its own repackager subprocess: buffered +
//! live fragments replayed from the [`PreBuffer`] are piped into its
//! stdin, and its stdout box stream is reassembled into deliverable
//! packets — one combined `ftyp`+`moov` init packet first, then one
//! packet per `moof`+`mdat` pair.
//!
//! ```text
//! PreBuffer ──replay──> repackager stdin
//!                        repackager stdout ──BoxReader──> PacketAssembler
//!                                                         └─> RecordingPacket*
//! ```
//!
//! Failure semantics favor partial recordings over dropped sessions: a
//! repackager that dies mid-stream ends the packet sequence with a
//! terminal packet instead of surfacing an error to the host's iterator.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use crate::error::{BridgeError, Result};

use super::boxes::{BoxKind, BoxReader, MediaBox};
use super::prebuffer::PreBuffer;
use super::transcoder::{MediaProcess, Spawner, record_args};

/// Recording parameters negotiated with the host before the first request.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Look-back window replayed from the prebuffer for each recording.
    pub prebuffer_window: Duration,
    /// Fragment duration requested by the host.
    pub fragment_duration: Duration,
}

/// One deliverable unit of a recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPacket {
    pub data: Vec<u8>,
    /// Set on the terminal packet; the sequence ends after it.
    pub is_last: bool,
}

/// Reassembles a box stream into recording packets.
///
/// `ftyp`/`moov` accumulate until the first `moof` arrives, at which point
/// they are emitted as one init packet. Each `moof` is then held until its
/// `mdat` completes the pair (strict FIFO). An `mdat` with no unconsumed
/// `moof` is protocol error: dropped with a warning, never delivered.
#[derive(Default)]
pub struct PacketAssembler {
    init: Vec<u8>,
    init_emitted: bool,
    pending_moof: Option<Vec<u8>>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one box; returns zero or more completed packets in order.
    pub fn push(&mut self, media_box: &MediaBox) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        match media_box.kind {
            BoxKind::Ftyp | BoxKind::Moov => {
                if self.init_emitted {
                    tracing::warn!(kind = %media_box.kind, "init box after init packet, dropping");
                } else {
                    self.init.extend_from_slice(&media_box.data);
                }
            }
            BoxKind::Moof => {
                if !self.init_emitted && !self.init.is_empty() {
                    out.push(std::mem::take(&mut self.init));
                    self.init_emitted = true;
                }
                if let Some(orphan) = self.pending_moof.replace(media_box.data.clone()) {
                    tracing::warn!(bytes = orphan.len(), "moof superseded before its mdat, dropping");
                }
            }
            BoxKind::Mdat => match self.pending_moof.take() {
                Some(mut pair) => {
                    pair.extend_from_slice(&media_box.data);
                    out.push(pair);
                }
                None => {
                    tracing::warn!(bytes = media_box.len(), "orphaned mdat with no preceding moof, dropping");
                }
            },
            BoxKind::Other(_) => {
                tracing::debug!(kind = %media_box.kind, "ignoring box kind in recording stream");
            }
        }
        out
    }
}

struct ActiveStream {
    cancel: Arc<AtomicBool>,
}

/// Orchestrates recording requests against one shared prebuffer.
///
/// The prebuffer is started lazily on the first request and shared across
/// all subsequent ones; each request owns its repackager subprocess and
/// cancellation token.
pub struct RecordingSession {
    prebuffer: Arc<PreBuffer>,
    spawner: Arc<dyn Spawner>,
    kill_grace: Duration,
    config: RwLock<Option<RecordingConfig>>,
    active: Mutex<HashMap<u32, ActiveStream>>,
    recording_active: Arc<AtomicBool>,
}

impl RecordingSession {
    pub fn new(
        prebuffer: Arc<PreBuffer>,
        spawner: Arc<dyn Spawner>,
        kill_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            prebuffer,
            spawner,
            kill_grace,
            config: RwLock::new(None),
            active: Mutex::new(HashMap::new()),
            recording_active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Store the host-negotiated recording configuration.
    pub fn set_config(&self, config: RecordingConfig) {
        tracing::debug!(
            window_ms = config.prebuffer_window.as_millis() as u64,
            fragment_ms = config.fragment_duration.as_millis() as u64,
            "recording configuration negotiated"
        );
        *self.config.write() = Some(config);
    }

    /// The host-negotiated configuration, or a typed error before any
    /// negotiation has happened.
    pub fn negotiated_config(&self) -> Result<RecordingConfig> {
        self.config
            .read()
            .clone()
            .ok_or(BridgeError::RecordingNotConfigured)
    }

    /// Shared flag, true while any recording stream is open.
    ///
    /// Motion polling is suppressed while it is set to keep snapshots from
    /// contending with the recording pipeline.
    pub fn recording_active(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recording_active)
    }

    /// Begin a recording stream for a host-assigned stream id.
    ///
    /// Missing configuration fails fast: the returned stream yields one
    /// empty terminal packet. All other failures along the setup path
    /// degrade the same way — the host sees a finished (possibly empty)
    /// recording, never a hung iterator.
    pub fn begin_stream(self: &Arc<Self>, stream_id: u32) -> RecordingStream {
        if self.active.lock().contains_key(&stream_id) {
            tracing::warn!(stream_id, "recording stream id already active, refusing duplicate");
            return RecordingStream::terminal(Arc::clone(self), stream_id);
        }

        let config = match self.negotiated_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "recording requested with no negotiated configuration");
                return RecordingStream::terminal(Arc::clone(self), stream_id);
            }
        };

        if let Err(e) = self.prebuffer.start() {
            tracing::warn!(stream_id, error = %e, "prebuffer start failed for recording");
            return RecordingStream::terminal(Arc::clone(self), stream_id);
        }

        let replay = match self.prebuffer.replay(config.prebuffer_window) {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "replay unavailable for recording");
                return RecordingStream::terminal(Arc::clone(self), stream_id);
            }
        };

        let mut process = match self.spawner.spawn(&record_args(config.fragment_duration)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "repackager spawn failed");
                return RecordingStream::terminal(Arc::clone(self), stream_id);
            }
        };

        let Some(stdout) = process.take_stdout() else {
            tracing::warn!(stream_id, "repackager has no stdout");
            process.stop(self.kill_grace);
            return RecordingStream::terminal(Arc::clone(self), stream_id);
        };

        if let Some(stdin) = process.take_stdin() {
            thread::spawn(move || pump_replay(replay, stdin));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock();
            active.insert(
                stream_id,
                ActiveStream {
                    cancel: Arc::clone(&cancel),
                },
            );
            self.recording_active.store(true, Ordering::SeqCst);
            tracing::info!(stream_id, open = active.len(), "recording stream opened");
        }

        RecordingStream {
            session: Arc::clone(self),
            stream_id,
            cancel,
            reader: Some(BoxReader::new(stdout)),
            process: Some(process),
            assembler: PacketAssembler::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    /// Cancel a stream by id. Safe to call for unknown or already-closed
    /// ids (no-op). The stream's iterator observes the cancellation at its
    /// next step and terminates.
    pub fn close_stream(&self, stream_id: u32) {
        let entry = self.active.lock().remove(&stream_id);
        match entry {
            Some(stream) => {
                stream.cancel.store(true, Ordering::SeqCst);
                tracing::debug!(stream_id, "recording stream close requested");
            }
            None => {
                tracing::debug!(stream_id, "close for unknown recording stream, ignoring");
            }
        }
        self.refresh_active_flag();
    }

    /// Number of open recording streams.
    pub fn open_streams(&self) -> usize {
        self.active.lock().len()
    }

    /// Unregister a stream, but only if the entry still belongs to the
    /// caller's cancellation token. A finished stream must never evict a
    /// successor registered under the same id.
    fn release(&self, stream_id: u32, token: &Arc<AtomicBool>) {
        {
            let mut active = self.active.lock();
            if active
                .get(&stream_id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.cancel, token))
            {
                active.remove(&stream_id);
            }
        }
        self.refresh_active_flag();
    }

    fn refresh_active_flag(&self) {
        let any = !self.active.lock().is_empty();
        self.recording_active.store(any, Ordering::SeqCst);
    }
}

/// Feed replayed fragments into the repackager's stdin.
///
/// A write failure means the repackager went away; dropping the receiver
/// unregisters the prebuffer tap.
fn pump_replay(replay: mpsc::Receiver<MediaBox>, mut stdin: Box<dyn std::io::Write + Send>) {
    for fragment in replay {
        if stdin.write_all(&fragment.data).is_err() {
            tracing::debug!("repackager stdin closed, replay pump ending");
            break;
        }
    }
    // stdin drops here; the repackager sees input EOF and finalizes.
}

/// Lazy sequence of recording packets for one request.
///
/// The cancellation token is checked before each yield; cancellation,
/// clean end-of-stream, framing errors, and subprocess death all converge
/// on the same terminal packet (`is_last = true`) followed by `None`.
pub struct RecordingStream {
    session: Arc<RecordingSession>,
    stream_id: u32,
    cancel: Arc<AtomicBool>,
    reader: Option<BoxReader<Box<dyn Read + Send>>>,
    process: Option<Box<dyn MediaProcess>>,
    assembler: PacketAssembler,
    ready: VecDeque<Vec<u8>>,
    done: bool,
}

impl RecordingStream {
    /// A stream that yields only the terminal packet (fail-fast path).
    fn terminal(session: Arc<RecordingSession>, stream_id: u32) -> Self {
        Self {
            session,
            stream_id,
            cancel: Arc::new(AtomicBool::new(true)),
            reader: None,
            process: None,
            assembler: PacketAssembler::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn finish(&mut self) -> RecordingPacket {
        self.done = true;
        self.reader = None;
        if let Some(mut process) = self.process.take() {
            process.stop(self.session.kill_grace);
        }
        self.session.release(self.stream_id, &self.cancel);
        tracing::debug!(stream_id = self.stream_id, "recording stream finished");
        RecordingPacket {
            data: Vec::new(),
            is_last: true,
        }
    }
}

impl Iterator for RecordingStream {
    type Item = RecordingPacket;

    fn next(&mut self) -> Option<RecordingPacket> {
        if self.done {
            return None;
        }
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Some(self.finish());
            }
            if let Some(data) = self.ready.pop_front() {
                return Some(RecordingPacket {
                    data,
                    is_last: false,
                });
            }
            let Some(reader) = self.reader.as_mut() else {
                return Some(self.finish());
            };
            match reader.read_box() {
                Ok(Some(media_box)) => {
                    self.ready.extend(self.assembler.push(&media_box));
                }
                Ok(None) => return Some(self.finish()),
                Err(e) => {
                    // Mid-stream subprocess death or framing loss: end of
                    // stream, not a fault for the caller's iteration.
                    tracing::warn!(stream_id = self.stream_id, error = %e, "recording stream ended abnormally");
                    return Some(self.finish());
                }
            }
        }
    }
}

impl Drop for RecordingStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.store(true, Ordering::SeqCst);
            let _ = self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    fn boxed(tag: &[u8; 4], payload: &[u8]) -> MediaBox {
        MediaBox::build(tag, payload)
    }

    // --- Packet assembly ---

    #[test]
    fn header_then_two_pairs() {
        // [ftyp, moov, moof, mdat, moof, mdat] -> init packet + 2 pair packets.
        let mut assembler = PacketAssembler::new();
        let ftyp = boxed(b"ftyp", b"isom");
        let moov = boxed(b"moov", &[0xAB; 12]);
        let moof1 = boxed(b"moof", &[1; 4]);
        let mdat1 = boxed(b"mdat", &[2; 8]);
        let moof2 = boxed(b"moof", &[3; 4]);
        let mdat2 = boxed(b"mdat", &[4; 8]);

        assert!(assembler.push(&ftyp).is_empty());
        assert!(assembler.push(&moov).is_empty());

        let init = assembler.push(&moof1);
        assert_eq!(init.len(), 1, "init packet emitted at first moof");
        assert_eq!(init[0], [ftyp.data.clone(), moov.data.clone()].concat());

        let pair1 = assembler.push(&mdat1);
        assert_eq!(pair1.len(), 1);
        assert_eq!(pair1[0], [moof1.data.clone(), mdat1.data.clone()].concat());

        assert!(assembler.push(&moof2).is_empty());
        let pair2 = assembler.push(&mdat2);
        assert_eq!(pair2[0], [moof2.data.clone(), mdat2.data.clone()].concat());
    }

    #[test]
    fn orphaned_mdat_is_dropped() {
        let mut assembler = PacketAssembler::new();
        assert!(assembler.push(&boxed(b"mdat", &[9; 4])).is_empty());
        // Pairing still works afterwards.
        assembler.push(&boxed(b"moof", &[1; 4]));
        assert_eq!(assembler.push(&boxed(b"mdat", &[2; 4])).len(), 1);
    }

    #[test]
    fn init_packet_emitted_once() {
        let mut assembler = PacketAssembler::new();
        assembler.push(&boxed(b"ftyp", b"isom"));
        let first = assembler.push(&boxed(b"moof", &[1; 4]));
        assert_eq!(first.len(), 1);
        assembler.push(&boxed(b"mdat", &[2; 4]));
        // A late moov must not produce a second init packet.
        assembler.push(&boxed(b"moov", &[3; 4]));
        let later = assembler.push(&boxed(b"moof", &[4; 4]));
        assert!(later.is_empty());
    }

    #[test]
    fn moof_without_mdat_is_superseded() {
        let mut assembler = PacketAssembler::new();
        let moof1 = boxed(b"moof", &[1; 4]);
        let moof2 = boxed(b"moof", &[2; 4]);
        let mdat = boxed(b"mdat", &[3; 4]);
        assembler.push(&moof1);
        assembler.push(&moof2);
        let packets = assembler.push(&mdat);
        assert_eq!(packets.len(), 1);
        // The pair is built from the most recent moof.
        assert_eq!(packets[0], [moof2.data, mdat.data].concat());
    }

    #[test]
    fn unknown_boxes_are_ignored() {
        let mut assembler = PacketAssembler::new();
        assert!(assembler.push(&boxed(b"styp", &[0; 4])).is_empty());
    }

    // --- Configuration precondition ---

    struct NullSpawner;

    impl Spawner for NullSpawner {
        fn spawn(&self, _args: &[String]) -> Result<Box<dyn MediaProcess>> {
            Err(BridgeError::SpawnFailed {
                program: "none".to_string(),
                source: std::io::Error::other("not spawnable"),
            })
        }
    }

    #[test]
    fn configuration_precondition_is_typed() {
        let prebuffer = PreBuffer::new(CameraConfig::default(), Arc::new(NullSpawner));
        let session = RecordingSession::new(prebuffer, Arc::new(NullSpawner), Duration::from_secs(1));

        assert!(matches!(
            session.negotiated_config(),
            Err(BridgeError::RecordingNotConfigured)
        ));

        session.set_config(RecordingConfig {
            prebuffer_window: Duration::from_secs(4),
            fragment_duration: Duration::from_millis(4000),
        });
        assert!(session.negotiated_config().is_ok());
    }
}
