use clap::Parser;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use loxkit::camera::transcoder::FfmpegSpawner;
use loxkit::camera::{MotionDetector, PreBuffer, RecordingSession, StreamingSession};
use loxkit::config::{CameraConfig, SourceAuth, StreamingConfig};

#[derive(Parser)]
#[command(
    name = "loxkit-cam",
    about = "Run the intercom camera pipeline standalone: prebuffer + motion events"
)]
struct Args {
    /// Camera source URL (RTSP/HTTP)
    #[arg(long)]
    source: String,

    /// Still-image URL for snapshots (defaults to the source URL)
    #[arg(long)]
    snapshot_url: Option<String>,

    /// Source username
    #[arg(long)]
    user: Option<String>,

    /// Source password
    #[arg(long)]
    password: Option<String>,

    /// Transcoder binary
    #[arg(long, default_value = "ffmpeg")]
    transcoder: String,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let auth = match (args.user, args.password) {
        (Some(user), Some(password)) => Some(SourceAuth { user, password }),
        _ => None,
    };
    let camera = CameraConfig {
        source_url: args.source,
        snapshot_url: args.snapshot_url,
        auth,
        transcoder: args.transcoder.clone(),
        ..CameraConfig::default()
    };

    let spawner = Arc::new(FfmpegSpawner::new(&args.transcoder));
    let prebuffer = PreBuffer::new(camera.clone(), spawner.clone());
    if let Err(e) = prebuffer.start() {
        eprintln!("Failed to start prebuffer: {e}");
        return;
    }

    let streaming = StreamingSession::new(camera.clone(), StreamingConfig::default(), spawner.clone());
    let recording = RecordingSession::new(prebuffer.clone(), spawner, camera.kill_grace);

    let stop = Arc::new(AtomicBool::new(false));
    let detector = MotionDetector::new(camera.motion.clone());
    let handle = detector.spawn(
        streaming,
        recording.recording_active(),
        stop.clone(),
        Box::new(|motion| {
            if motion {
                println!("motion detected");
            } else {
                println!("motion cleared");
            }
        }),
    );

    println!("Prebuffering {} — press Enter to stop", camera.source_url);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    stop.store(true, Ordering::SeqCst);
    prebuffer.stop();
    let _ = handle.join();
}
