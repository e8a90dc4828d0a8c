//! Viewer-side stream session: receive, render, steer.
//!
//! A receiver thread reads LP images off the socket, renders them,
//! and deposits the raster in a mutex-guarded slot flagged "new
//! image available". The window loop polls that slot from the UI
//! thread and feeds key presses back through the frame-synchronised
//! command gate:
//!
//! - `can_send_command` turns true whenever the receiver hands off a
//!   rendered frame and false after a command goes out, so at most
//!   one command is in flight per received frame.
//! - Sends are additionally throttled to one per
//!   [`KEY_THROTTLE_MS`]; key presses during the throttle window
//!   coalesce and only the latest queued command survives.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::LpxError;
use crate::lp_image::LpImage;
use crate::render::{Raster, Renderer};
use crate::tables::ScanTables;
use crate::wire::{self, MovementCommand};

/// Minimum spacing between outgoing movement commands (~60 Hz).
pub const KEY_THROTTLE_MS: u64 = 16;

// ── FrameStats ───────────────────────────────────────────────────

/// Rolling reception statistics for the window title.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Smoothed frames per second.
    pub fps: f32,
    /// Total frames received since connect.
    pub total_frames: u64,
    /// Total payload bytes received.
    pub total_bytes: u64,
}

// ── ViewerConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Rendered raster size.
    pub width: u32,
    pub height: u32,
    /// Render scale passed to the renderer.
    pub scale: f32,
    /// Spacing between outgoing commands.
    pub key_throttle: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            scale: 1.0,
            key_throttle: Duration::from_millis(KEY_THROTTLE_MS),
        }
    }
}

// ── ViewerClient ─────────────────────────────────────────────────

struct DisplaySlot {
    raster: Option<Raster>,
    image: Option<LpImage>,
    new_image: bool,
}

struct ViewerShared {
    running: AtomicBool,
    can_send_command: AtomicBool,
    display: Mutex<DisplaySlot>,
    stats: Mutex<FrameStats>,
    frames_received: AtomicU64,
}

/// A connected debug-viewer session.
pub struct ViewerClient {
    shared: Arc<ViewerShared>,
    stream: TcpStream,
    receiver: Option<JoinHandle<()>>,
    pending: Option<MovementCommand>,
    last_send: Option<Instant>,
    throttle: Duration,
}

impl ViewerClient {
    /// Connect to a server and start the receiver thread.
    pub fn connect(
        addr: impl ToSocketAddrs,
        tables: Arc<ScanTables>,
        config: ViewerConfig,
    ) -> Result<Self, LpxError> {
        let stream = TcpStream::connect(addr).map_err(LpxError::Socket)?;
        stream.set_nodelay(true).map_err(LpxError::Socket)?;
        let peer = stream.peer_addr().map_err(LpxError::Socket)?;

        let mut renderer = Renderer::new();
        renderer.set_scan_tables(tables)?;

        let shared = Arc::new(ViewerShared {
            running: AtomicBool::new(true),
            can_send_command: AtomicBool::new(false),
            display: Mutex::new(DisplaySlot {
                raster: None,
                image: None,
                new_image: false,
            }),
            stats: Mutex::new(FrameStats::default()),
            frames_received: AtomicU64::new(0),
        });

        let recv_stream = stream.try_clone().map_err(LpxError::Socket)?;
        let recv_shared = Arc::clone(&shared);
        let recv_config = config.clone();
        let receiver = std::thread::Builder::new()
            .name("lpx-receiver".to_string())
            .spawn(move || receiver_loop(recv_shared, recv_stream, renderer, recv_config))
            .expect("thread spawn");

        info!(%peer, "connected to stream server");
        Ok(Self {
            shared,
            stream,
            receiver: Some(receiver),
            pending: None,
            last_send: None,
            throttle: config.key_throttle,
        })
    }

    /// Whether the receiver is still attached to the server.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Take the most recent rendered frame, if one arrived since the
    /// last call.
    pub fn take_frame(&self) -> Option<Raster> {
        let mut slot = self.shared.display.lock().unwrap_or_else(|e| e.into_inner());
        if slot.new_image {
            slot.new_image = false;
            slot.raster.take()
        } else {
            None
        }
    }

    /// Clone of the most recently received LP image (for snapshots).
    pub fn latest_image(&self) -> Option<LpImage> {
        let slot = self.shared.display.lock().unwrap_or_else(|e| e.into_inner());
        slot.image.clone()
    }

    /// Reception statistics.
    pub fn stats(&self) -> FrameStats {
        *self.shared.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a movement command. Replaces any command still waiting
    /// for its send window — only the latest press survives.
    pub fn queue_movement(&mut self, delta_x: f32, delta_y: f32, step_size: f32) {
        self.pending = Some(MovementCommand::new(delta_x, delta_y, step_size));
    }

    /// Send the pending command if the frame gate and the throttle
    /// both allow it. Call once per UI tick.
    ///
    /// Returns `true` when a command went out.
    pub fn pump_commands(&mut self) -> Result<bool, LpxError> {
        if self.pending.is_none() {
            return Ok(false);
        }
        if !self.shared.can_send_command.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Some(last) = self.last_send {
            if last.elapsed() < self.throttle {
                return Ok(false);
            }
        }

        let cmd = self.pending.take().expect("checked above");
        wire::send_movement(&mut self.stream, &cmd)?;
        self.shared.can_send_command.store(false, Ordering::SeqCst);
        self.last_send = Some(Instant::now());
        debug!(dx = cmd.delta_x, dy = cmd.delta_y, step = cmd.step_size, "sent movement");
        Ok(true)
    }

    /// Tear the session down and join the receiver.
    pub fn disconnect(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        info!("disconnected from stream server");
    }
}

impl Drop for ViewerClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receiver_loop(
    shared: Arc<ViewerShared>,
    mut stream: TcpStream,
    renderer: Renderer,
    config: ViewerConfig,
) {
    let mut last_arrival = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        let image = match wire::read_image(&mut stream) {
            Ok(image) => image,
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!(error = %e, "stream receive failed, disconnecting");
                }
                break;
            }
        };

        let payload_bytes = wire::HEADER_BYTES as u64 + image.length() as u64 * 4 + 4;
        let total = shared.frames_received.fetch_add(1, Ordering::Relaxed) + 1;

        let raster = match renderer.render(&image, config.width, config.height, config.scale) {
            Ok(raster) => raster,
            Err(e) => {
                // Drop the frame, keep the stream alive.
                warn!(error = %e, "render failed, dropping frame");
                continue;
            }
        };

        {
            let mut slot = shared.display.lock().unwrap_or_else(|e| e.into_inner());
            slot.raster = Some(raster);
            slot.image = Some(image);
            slot.new_image = true;
        }
        // The frame gate opens on every hand-off.
        shared.can_send_command.store(true, Ordering::SeqCst);

        let now = Instant::now();
        let dt = now.duration_since(last_arrival).as_secs_f32();
        last_arrival = now;
        let mut stats = shared.stats.lock().unwrap_or_else(|e| e.into_inner());
        let instant_fps = if dt > 0.0 { 1.0 / dt } else { 0.0 };
        stats.fps = if stats.fps == 0.0 {
            instant_fps
        } else {
            stats.fps * 0.9 + instant_fps * 0.1
        };
        stats.total_frames = total;
        stats.total_bytes += payload_bytes;
    }

    shared.running.store(false, Ordering::SeqCst);
    debug!("receiver thread exiting");
}

// ── Tests ────────────────────────────────────────────────────────
