//! Stream a webcam as a log-polar cell stream with motion-adaptive
//! frame skipping.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use lpx_core::{ScanTables, ServerConfig, StreamServer, DEFAULT_PORT};
use lpx_server::sources::WebcamSource;

#[derive(Parser, Debug)]
#[command(version, about = "LPX webcam streaming server")]
struct Args {
    /// Precomputed scan-table file.
    scan_table: PathBuf,

    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Camera index (0 = default device).
    #[arg(long, default_value_t = 0)]
    camera: u32,

    /// Output width frames are resampled to before scanning.
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Output height frames are resampled to before scanning.
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Keep at most every Nth frame when the pipeline has headroom.
    #[arg(long, default_value_t = 2)]
    min_skip: u32,

    /// Keep at least every Nth frame when falling behind.
    #[arg(long, default_value_t = 6)]
    max_skip: u32,

    /// Mean-absolute-difference score above which a frame counts as
    /// motion.
    #[arg(long, default_value_t = 5.0)]
    motion_threshold: f32,

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
    let source = WebcamSource::open(args.camera).context("opening webcam")?;

    let config = ServerConfig {
        port: args.port,
        min_skip: args.min_skip,
        max_skip: args.max_skip,
        motion_threshold: args.motion_threshold,
        rewind_on_first_client: false,
        ..ServerConfig::default()
    };
    let mut server = StreamServer::new(tables, config)?;
    let addr = server
        .start(Box::new(source), args.width, args.height)
        .context("starting server")?;
    info!(%addr, "webcam server ready, press Ctrl-C to stop");

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
