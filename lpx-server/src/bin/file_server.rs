//! Stream a video file as a log-polar cell stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use lpx_core::{ScanTables, ServerConfig, StreamServer, DEFAULT_PORT};
use lpx_server::sources::Y4mFileSource;

#[derive(Parser, Debug)]
#[command(version, about = "LPX file streaming server")]
struct Args {
    /// Precomputed scan-table file.
    scan_table: PathBuf,

    /// Video file in YUV4MPEG2 format (`ffmpeg -i clip.mp4 clip.y4m`).
    video: PathBuf,

    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Output width frames are resampled to before scanning.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Output height frames are resampled to before scanning.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Playback rate; 0 uses the file's native rate.
    #[arg(long, default_value_t = 0.0)]
    fps: f32,

    /// Stop at the end of the file instead of looping.
    #[arg(long)]
    no_loop: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    lpx_server::init_logging(&args.log_level);

    let tables = Arc::new(
        ScanTables::load(&args.scan_table)
            .with_context(|| format!("loading scan tables {}", args.scan_table.display()))?,
    );
    let source = Y4mFileSource::open(&args.video)
        .with_context(|| format!("opening video {}", args.video.display()))?;

    let config = ServerConfig {
        port: args.port,
        target_fps: args.fps,
        looping: !args.no_loop,
        ..ServerConfig::default()
    };
    let mut server = StreamServer::new(tables, config)?;
    let addr = server
        .start(Box::new(source), args.width, args.height)
        .context("starting server")?;
    info!(%addr, "file server ready, press Ctrl-C to stop");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("installing SIGINT handler")?;
    }

    let mut last_count = usize::MAX;
    while !interrupted.load(Ordering::SeqCst) && server.is_running() {
        let count = server.client_count();
        if count != last_count {
            info!(clients = count, "client count changed");
            last_count = count;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    server.stop();
    Ok(())
}
