//! Rolling fragment prebuffer.
//!
//! One transcoder subprocess per buffer copies the camera source into a
//! fragmented-MP4 box stream; a reader thread parses it and retains a
//! sliding window of fragments so recording requests can "look back"
//! without re-asking the camera.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle       -> start()            -> Buffering (subprocess + reader thread)
//! Buffering  -> start()            -> Buffering (idempotent, same instance)
//! Buffering  -> source EOF / framing error -> Idle (fragments retained)
//! Idle       -> start()            -> Buffering (fresh subprocess)
//! ```
//!
//! ## Retention
//!
//! Two independent bounds, both enforced on every insertion: fragments
//! older than the retention window are dropped first, then the count cap
//! is applied oldest-first. Overload is handled by discarding old data,
//! never by blocking the producer.
//!
//! The init boxes (`ftyp`/`moov`) are kept aside rather than in the
//! window — they describe the whole stream and must precede any replayed
//! fragment regardless of age.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{CameraConfig, PreBufferConfig};
use crate::error::{BridgeError, Result};

use super::boxes::{BoxKind, BoxReader, MediaBox};
use super::transcoder::{MediaProcess, Spawner, prebuffer_args};

/// A live delivery channel opened by [`PreBuffer::replay`].
struct Tap {
    sender: mpsc::Sender<MediaBox>,
    /// Safety deadline; a consumer that never disconnects is cut here.
    deadline: Instant,
}

#[derive(Default)]
struct BufferState {
    /// `ftyp` then `moov`, captured once per subprocess run.
    init: Vec<MediaBox>,
    fragments: VecDeque<MediaBox>,
    taps: Vec<Tap>,
}

/// Sliding time/count-bounded buffer of parsed media fragments.
pub struct PreBuffer {
    config: CameraConfig,
    spawner: Arc<dyn Spawner>,
    state: Mutex<BufferState>,
    buffering: AtomicBool,
    /// Bumped on every successful `start()`. A reader thread from an
    /// earlier run compares its generation before touching shared state,
    /// so a stale reader's death cannot tear down a restarted buffer.
    generation: AtomicU64,
    process: Mutex<Option<Box<dyn MediaProcess>>>,
}

impl PreBuffer {
    pub fn new(config: CameraConfig, spawner: Arc<dyn Spawner>) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            state: Mutex::new(BufferState::default()),
            buffering: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            process: Mutex::new(None),
        })
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }

    /// Spawn the producer subprocess and reader thread.
    ///
    /// Idempotent: a second call while buffering returns without spawning.
    /// A spawn failure leaves the buffer Idle so the caller may retry.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.buffering.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let args = prebuffer_args(&self.config);
        let mut process = match self.spawner.spawn(&args) {
            Ok(p) => p,
            Err(e) => {
                self.buffering.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let stdout = match process.take_stdout() {
            Some(s) => s,
            None => {
                self.buffering.store(false, Ordering::SeqCst);
                process.stop(self.config.kill_grace);
                return Err(BridgeError::Io(std::io::Error::other(
                    "transcoder spawned without stdout",
                )));
            }
        };

        {
            // Replace any dead handle from a previous run.
            let mut slot = self.process.lock();
            if let Some(mut old) = slot.take() {
                old.stop(self.config.kill_grace);
            }
            *slot = Some(process);
        }
        // Fresh subprocess emits a fresh init segment.
        self.state.lock().init.clear();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(source = %self.config.source_url, generation, "prebuffer started");

        let this = Arc::clone(self);
        thread::spawn(move || this.read_loop(stdout, generation));
        Ok(())
    }

    /// Stop buffering and terminate the subprocess. Idempotent; retained
    /// fragments stay available for history-only replay.
    pub fn stop(&self) {
        let was_buffering = self.buffering.swap(false, Ordering::SeqCst);
        if let Some(mut process) = self.process.lock().take() {
            process.stop(self.config.kill_grace);
        }
        if was_buffering {
            tracing::debug!("prebuffer stopped");
        }
    }

    /// Open a one-shot delivery channel.
    ///
    /// The receiver first sees the init boxes, then every retained
    /// fragment younger than `window` starting at the first `moof`
    /// (anything earlier would orphan an `mdat`), then live fragments
    /// until the receiver is dropped or the safety timeout elapses.
    ///
    /// On an Idle buffer the channel carries history only and then
    /// disconnects.
    pub fn replay(&self, window: Duration) -> Result<mpsc::Receiver<MediaBox>> {
        let mut state = self.state.lock();
        let buffering = self.is_buffering();
        if !buffering && state.init.is_empty() && state.fragments.is_empty() {
            return Err(BridgeError::BufferNotRunning);
        }

        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        for init in &state.init {
            let _ = tx.send(init.clone());
        }

        let mut seen_moof = false;
        let mut sent = 0usize;
        for fragment in &state.fragments {
            if now.duration_since(fragment.captured_at) > window {
                continue;
            }
            if !seen_moof {
                if fragment.kind == BoxKind::Moof {
                    seen_moof = true;
                } else {
                    tracing::debug!(kind = %fragment.kind, "skipping pre-moof fragment in replay window");
                    continue;
                }
            }
            let _ = tx.send(fragment.clone());
            sent += 1;
        }

        tracing::debug!(
            window_ms = window.as_millis() as u64,
            history = sent,
            live = buffering,
            "replay stream opened"
        );

        if buffering {
            state.taps.push(Tap {
                sender: tx,
                deadline: now + self.config.prebuffer.replay_timeout,
            });
        }
        Ok(rx)
    }

    /// Number of retained fragments (init boxes excluded).
    pub fn fragment_count(&self) -> usize {
        self.state.lock().fragments.len()
    }

    fn read_loop(self: Arc<Self>, stdout: Box<dyn Read + Send>, generation: u64) {
        let mut reader = BoxReader::new(stdout);
        loop {
            if self.generation.load(Ordering::SeqCst) != generation || !self.is_buffering() {
                break;
            }
            match reader.read_box() {
                Ok(Some(media_box)) => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        self.insert(media_box);
                    }
                }
                Ok(None) => {
                    tracing::warn!("prebuffer source ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "prebuffer reader failed");
                    break;
                }
            }
        }

        // Only the reader that still owns the buffer may tear it down; a
        // reader superseded by a restart exits without touching state.
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "superseded prebuffer reader exited");
            return;
        }

        // Fatal for this buffer instance: back to Idle, live taps closed.
        self.buffering.store(false, Ordering::SeqCst);
        let dropped = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.taps).len()
        };
        if dropped > 0 {
            tracing::debug!(taps = dropped, "live taps closed on reader exit");
        }
    }

    fn insert(&self, media_box: MediaBox) {
        let mut state = self.state.lock();

        if media_box.kind.is_init() {
            tracing::debug!(kind = %media_box.kind, bytes = media_box.len(), "init box captured");
            state.init.push(media_box.clone());
        } else {
            state.fragments.push_back(media_box.clone());
            evict(&mut state.fragments, Instant::now(), &self.config.prebuffer);
        }

        let now = Instant::now();
        state
            .taps
            .retain(|tap| tap.deadline > now && tap.sender.send(media_box.clone()).is_ok());
    }
}

impl Drop for PreBuffer {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.lock().take() {
            process.stop(self.config.kill_grace);
        }
    }
}

/// Dual-bound eviction: time window first, then count cap, oldest-first.
fn evict(fragments: &mut VecDeque<MediaBox>, now: Instant, config: &PreBufferConfig) {
    while let Some(front) = fragments.front() {
        if now.duration_since(front.captured_at) > config.retention {
            fragments.pop_front();
        } else {
            break;
        }
    }
    while fragments.len() > config.max_fragments {
        fragments.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment_at(now: Instant, age_ms: u64) -> MediaBox {
        MediaBox::with_timestamp(
            BoxKind::Moof,
            vec![0u8; 16],
            now - Duration::from_millis(age_ms),
        )
    }

    fn window_config(retention_ms: u64, max: usize) -> PreBufferConfig {
        PreBufferConfig {
            retention: Duration::from_millis(retention_ms),
            max_fragments: max,
            replay_timeout: Duration::from_secs(30),
        }
    }

    // --- Eviction ---

    #[test]
    fn time_bound_eviction() {
        // Fragments timestamped 0, 500, 1200, 1800 with a 1000ms window,
        // observed at now=1800: only 1200 and 1800 survive (ts >= 800).
        let now = Instant::now();
        let mut fragments: VecDeque<MediaBox> = [1800u64, 1300, 600, 0]
            .iter()
            .map(|age| fragment_at(now, *age))
            .collect();

        evict(&mut fragments, now, &window_config(1000, 100));

        assert_eq!(fragments.len(), 2);
        assert!(
            fragments
                .iter()
                .all(|f| now.duration_since(f.captured_at) <= Duration::from_millis(1000))
        );
    }

    #[test]
    fn boundary_fragment_is_retained() {
        // A fragment exactly as old as the window stays.
        let now = Instant::now();
        let mut fragments: VecDeque<MediaBox> = VecDeque::from([fragment_at(now, 1000)]);
        evict(&mut fragments, now, &window_config(1000, 100));
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn count_bound_applies_after_time_bound() {
        let now = Instant::now();
        let mut fragments: VecDeque<MediaBox> =
            (0..10).map(|i| fragment_at(now, 100 - i * 10)).collect();

        evict(&mut fragments, now, &window_config(10_000, 4));

        assert_eq!(fragments.len(), 4);
        // Oldest dropped first: the survivors are the four youngest.
        assert!(
            fragments
                .iter()
                .all(|f| now.duration_since(f.captured_at) <= Duration::from_millis(40))
        );
    }

    #[test]
    fn empty_deque_is_a_no_op() {
        let mut fragments = VecDeque::new();
        evict(&mut fragments, Instant::now(), &window_config(1000, 4));
        assert!(fragments.is_empty());
    }

    // --- Restart lifecycle ---

    /// Blocking reader fed by a channel; dropping the sender is EOF.
    struct FeedReader {
        rx: mpsc::Receiver<Vec<u8>>,
        buf: Vec<u8>,
        pos: usize,
    }

    impl Read for FeedReader {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.buf.len() {
                match self.rx.recv() {
                    Ok(chunk) => {
                        self.buf = chunk;
                        self.pos = 0;
                    }
                    Err(_) => return Ok(0),
                }
            }
            let n = (self.buf.len() - self.pos).min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct FeedProcess {
        stdout: Option<Box<dyn Read + Send>>,
    }

    impl MediaProcess for FeedProcess {
        fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
            self.stdout.take()
        }
        fn take_stdin(&mut self) -> Option<Box<dyn std::io::Write + Send>> {
            None
        }
        fn is_running(&mut self) -> bool {
            false
        }
        fn stop(&mut self, _grace: Duration) {}
    }

    /// Hands out one queued feed per spawn, in order.
    struct FeedSpawner {
        feeds: Mutex<Vec<mpsc::Receiver<Vec<u8>>>>,
    }

    impl Spawner for FeedSpawner {
        fn spawn(&self, _args: &[String]) -> Result<Box<dyn MediaProcess>> {
            let rx = self.feeds.lock().remove(0);
            Ok(Box::new(FeedProcess {
                stdout: Some(Box::new(FeedReader {
                    rx,
                    buf: Vec::new(),
                    pos: 0,
                })),
            }))
        }
    }

    fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn stale_reader_death_leaves_restarted_buffer_intact() {
        let (old_tx, old_rx) = mpsc::channel::<Vec<u8>>();
        let (new_tx, new_rx) = mpsc::channel::<Vec<u8>>();
        let spawner = Arc::new(FeedSpawner {
            feeds: Mutex::new(vec![old_rx, new_rx]),
        });
        let config = CameraConfig {
            source_url: "rtsp://cam.local/stream".to_string(),
            ..CameraConfig::default()
        };
        let prebuffer = PreBuffer::new(config, spawner);

        prebuffer.start().unwrap();
        old_tx.send(MediaBox::build(b"moof", &[1; 4]).data).unwrap();
        wait_for("first run's fragment", || prebuffer.fragment_count() == 1);

        prebuffer.stop();
        prebuffer.start().unwrap();
        assert!(prebuffer.is_buffering());

        let replay = prebuffer.replay(Duration::from_secs(60)).unwrap();
        // History from the first run survives the restart.
        let history = replay.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(history.kind, BoxKind::Moof);

        // The first run's reader dies only now; the restarted buffer and
        // its open tap must not notice.
        drop(old_tx);
        thread::sleep(Duration::from_millis(50));
        assert!(
            prebuffer.is_buffering(),
            "stale reader death must not flip the restarted buffer to Idle"
        );

        new_tx.send(MediaBox::build(b"moof", &[2; 4]).data).unwrap();
        let live = replay.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(live.data, MediaBox::build(b"moof", &[2; 4]).data);
    }
}
