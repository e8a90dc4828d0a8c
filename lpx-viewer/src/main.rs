//! Debug viewer: connect to an LPX server, render the cell stream,
//! steer the fovea with WASD.
//!
//! The receiver thread inside [`ViewerClient`] renders incoming
//! frames; this binary owns the window and the keyboard. Movement is
//! frame-synchronised — one command per received frame, throttled to
//! ~60 Hz, with rapid presses coalesced to the latest one.
//!
//! Keys: `W/A/S/D` move, `P` saves a PNG snapshot, `L` saves the raw
//! LP image, `Q`/`Esc` quit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use minifb::{Key, KeyRepeat, Window, WindowOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lpx_core::{Raster, ScanTables, ViewerClient, ViewerConfig, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(version, about = "LPX debug viewer")]
struct Args {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    /// Server port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Scan-table file matching the server's tables.
    #[arg(long)]
    tables: PathBuf,

    /// Window and render width.
    #[arg(long, default_value_t = 800)]
    width: u32,

    /// Window and render height.
    #[arg(long, default_value_t = 600)]
    height: u32,

    /// Render scale.
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Pixels moved per key press.
    #[arg(long, default_value_t = 10.0)]
    step: f32,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn save_snapshot(raster: &Raster, counter: u32) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(format!("lpx-snapshot-{counter:04}.png"));
    let img = image::RgbImage::from_raw(raster.width(), raster.height(), raster.to_rgb_bytes())
        .context("raster geometry mismatch")?;
    img.save(&path)?;
    Ok(path)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tables = Arc::new(
        ScanTables::load(&args.tables)
            .with_context(|| format!("loading scan tables {}", args.tables.display()))?,
    );

    let config = ViewerConfig {
        width: args.width,
        height: args.height,
        scale: args.scale,
        ..ViewerConfig::default()
    };
    let mut client = ViewerClient::connect((args.server.as_str(), args.port), tables, config)
        .with_context(|| format!("connecting to {}:{}", args.server, args.port))?;

    let mut window = Window::new(
        "LPX Debug View",
        args.width as usize,
        args.height as usize,
        WindowOptions::default(),
    )
    .context("creating window")?;
    window.limit_update_rate(Some(Duration::from_micros(16_600)));

    let mut current: Option<Raster> = None;
    let mut snapshot_counter = 0u32;

    while window.is_open() && client.is_running() {
        if window.is_key_down(Key::Escape) || window.is_key_down(Key::Q) {
            break;
        }

        if let Some(raster) = client.take_frame() {
            current = Some(raster);
        }
        match &current {
            Some(raster) => {
                window.update_with_buffer(
                    raster.pixels(),
                    raster.width() as usize,
                    raster.height() as usize,
                )?;
                let stats = client.stats();
                window.set_title(&format!(
                    "LPX Debug View — {:.1} fps, {} frames, {} KiB",
                    stats.fps,
                    stats.total_frames,
                    stats.total_bytes / 1024
                ));
            }
            None => window.update(),
        }

        if window.is_key_pressed(Key::W, KeyRepeat::Yes) {
            client.queue_movement(0.0, -1.0, args.step);
        }
        if window.is_key_pressed(Key::S, KeyRepeat::Yes) {
            client.queue_movement(0.0, 1.0, args.step);
        }
        if window.is_key_pressed(Key::A, KeyRepeat::Yes) {
            client.queue_movement(-1.0, 0.0, args.step);
        }
        if window.is_key_pressed(Key::D, KeyRepeat::Yes) {
            client.queue_movement(1.0, 0.0, args.step);
        }

        if window.is_key_pressed(Key::P, KeyRepeat::No) {
            if let Some(raster) = &current {
                match save_snapshot(raster, snapshot_counter) {
                    Ok(path) => {
                        info!(path = %path.display(), "saved snapshot");
                        snapshot_counter += 1;
                    }
                    Err(e) => warn!(error = %e, "snapshot failed"),
                }
            }
        }
        if window.is_key_pressed(Key::L, KeyRepeat::No) {
            if let Some(image) = client.latest_image() {
                let path = format!("lpx-frame-{snapshot_counter:04}.lpx");
                match image.save(&path) {
                    Ok(()) => {
                        info!(path = %path, "saved LP image");
                        snapshot_counter += 1;
                    }
                    Err(e) => warn!(error = %e, "LP image save failed"),
                }
            }
        }

        if let Err(e) = client.pump_commands() {
            warn!(error = %e, "command send failed, disconnecting");
            break;
        }
    }

    client.disconnect();
    Ok(())
}
