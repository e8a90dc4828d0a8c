//! The streaming server: capture → scan → broadcast.
//!
//! Four long-lived OS threads share one [`ServerShared`] state:
//!
//! 1. **capture** pulls frames from the source, paces or skips them,
//!    and pushes onto the frame queue.
//! 2. **processing** pops frames, scans them at the current fixation
//!    point, and pushes LP images onto the broadcast queue.
//! 3. **broadcast** pops images, drains at most one pending command
//!    per client, then writes the frame to every client.
//! 4. **acceptor** admits new clients on a non-blocking listener.
//!
//! Both queues are bounded at capacity 3 and drop their oldest entry
//! on overflow, so a slow consumer costs frames, never memory or
//! latency. Shutdown is cooperative: the running flag clears, the
//! queues close and wake all waiters, broadcast and acceptor join
//! first (so nothing touches client sockets), then the sockets close
//! and capture/processing join.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::LpxError;
use crate::lp_image::LpImage;
use crate::queue::BoundedQueue;
use crate::scan::Scanner;
use crate::source::{motion_score, Frame, FrameSource};
use crate::tables::ScanTables;
use crate::wire::{self, MovementCommand};

/// Both pipeline queues hold at most this many entries.
const QUEUE_CAPACITY: usize = 3;

/// Fixation offsets are clamped to this fraction of the scan map so
/// the scan region stays inside the tables' valid domain.
const MAX_OFFSET_FRACTION: f32 = 0.2;

/// Smoothing factor for the scan-latency EMA.
const LATENCY_EMA_ALPHA: f32 = 0.2;

/// Keep the per-client send buffer small to bound head-of-line
/// latency.
const SEND_BUFFER_BYTES: usize = 64 * 1024;

// ── Configuration ────────────────────────────────────────────────

/// Tunables for [`StreamServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Target FPS for file sources; `0.0` means use the source rate.
    pub target_fps: f32,
    /// Restart file sources at their end.
    pub looping: bool,
    /// Adaptive skip bounds for live sources.
    pub min_skip: u32,
    pub max_skip: u32,
    /// Mean-absolute-difference threshold for "frame has motion".
    pub motion_threshold: f32,
    /// Rewind the source when the first viewer connects, so it sees
    /// the stream from frame 0.
    pub rewind_on_first_client: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: wire::DEFAULT_PORT,
            target_fps: 0.0,
            looping: false,
            min_skip: 2,
            max_skip: 6,
            motion_threshold: 5.0,
            rewind_on_first_client: true,
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

struct ClientRecord {
    id: u64,
    stream: TcpStream,
}

struct ServerShared {
    scanner: Scanner,
    running: AtomicBool,
    looping: AtomicBool,
    target_fps: AtomicU32,
    skip_rate: AtomicU32,
    min_skip: AtomicU32,
    max_skip: AtomicU32,
    motion_threshold: AtomicU32,
    latency_ema: AtomicU32,
    motion_seen: AtomicBool,
    x_ofs: AtomicU32,
    y_ofs: AtomicU32,
    out_width: AtomicU32,
    out_height: AtomicU32,
    max_offset: f32,
    rewind_on_first_client: bool,
    rewind_requested: AtomicBool,
    frame_queue: BoundedQueue<Frame>,
    image_queue: BoundedQueue<LpImage>,
    clients: Mutex<Vec<ClientRecord>>,
    client_count: AtomicUsize,
    next_client_id: AtomicU64,
}

fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

impl ServerShared {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn center_offset(&self) -> (f32, f32) {
        (load_f32(&self.x_ofs), load_f32(&self.y_ofs))
    }

    fn set_center_offset(&self, x: f32, y: f32) {
        store_f32(&self.x_ofs, x.clamp(-self.max_offset, self.max_offset));
        store_f32(&self.y_ofs, y.clamp(-self.max_offset, self.max_offset));
    }

    fn apply_movement(&self, cmd: &MovementCommand) {
        let (x, y) = self.center_offset();
        self.set_center_offset(
            x + cmd.delta_x * cmd.step_size,
            y + cmd.delta_y * cmd.step_size,
        );
        let (nx, ny) = self.center_offset();
        debug!(nx, ny, "applied movement command");
    }

    /// Fold one scan latency into the EMA and retune the live-source
    /// skip rate.
    fn record_scan_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f32();
        let prev = load_f32(&self.latency_ema);
        let ema = if prev == 0.0 {
            sample
        } else {
            prev + LATENCY_EMA_ALPHA * (sample - prev)
        };
        store_f32(&self.latency_ema, ema);

        let min = self.min_skip.load(Ordering::Relaxed);
        let max = self.max_skip.load(Ordering::Relaxed);
        let current = self.skip_rate.load(Ordering::Relaxed);
        let mut next = current;
        if ema > 0.11 {
            // Falling behind: keep fewer frames.
            next = (current + 1).min(max);
        } else if ema < 0.09 && self.motion_seen.swap(false, Ordering::Relaxed) {
            // Headroom and the scene is moving: keep more frames.
            next = current.saturating_sub(1).max(min);
        }
        if next != current {
            info!(from = current, to = next, ema_s = ema, "adjusted skip rate");
            self.skip_rate.store(next, Ordering::Relaxed);
        }
    }

    /// Clone every client handle so the mutex is not held across
    /// socket writes.
    fn snapshot_clients(&self) -> Vec<(u64, TcpStream)> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .iter()
            .filter_map(|c| c.stream.try_clone().ok().map(|s| (c.id, s)))
            .collect()
    }

    fn remove_clients(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|c| {
            if ids.contains(&c.id) {
                let _ = c.stream.shutdown(Shutdown::Both);
                info!(client = c.id, "client disconnected");
                false
            } else {
                true
            }
        });
        self.client_count.store(clients.len(), Ordering::SeqCst);
    }
}

// ── StreamServer ─────────────────────────────────────────────────

/// Owns the scan tables, the fixation state, the pipeline queues,
/// and the client set.
pub struct StreamServer {
    shared: Arc<ServerShared>,
    port: u16,
    local_addr: Option<SocketAddr>,
    capture: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<()>>,
    broadcast: Option<JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Validate the tables and build the scanner (including its
    /// lookup cache).
    pub fn new(tables: Arc<ScanTables>, config: ServerConfig) -> Result<Self, LpxError> {
        let max_offset = MAX_OFFSET_FRACTION * tables.map_width() as f32;
        let scanner = Scanner::new(tables)?;

        let shared = Arc::new(ServerShared {
            scanner,
            running: AtomicBool::new(false),
            looping: AtomicBool::new(config.looping),
            target_fps: AtomicU32::new(config.target_fps.to_bits()),
            skip_rate: AtomicU32::new(config.min_skip.max(1)),
            min_skip: AtomicU32::new(config.min_skip.max(1)),
            max_skip: AtomicU32::new(config.max_skip.max(config.min_skip.max(1))),
            motion_threshold: AtomicU32::new(config.motion_threshold.to_bits()),
            latency_ema: AtomicU32::new(0f32.to_bits()),
            motion_seen: AtomicBool::new(false),
            x_ofs: AtomicU32::new(0f32.to_bits()),
            y_ofs: AtomicU32::new(0f32.to_bits()),
            out_width: AtomicU32::new(0),
            out_height: AtomicU32::new(0),
            max_offset,
            rewind_on_first_client: config.rewind_on_first_client,
            rewind_requested: AtomicBool::new(false),
            frame_queue: BoundedQueue::new(QUEUE_CAPACITY),
            image_queue: BoundedQueue::new(QUEUE_CAPACITY),
            clients: Mutex::new(Vec::new()),
            client_count: AtomicUsize::new(0),
            next_client_id: AtomicU64::new(1),
        });

        Ok(Self {
            shared,
            port: config.port,
            local_addr: None,
            capture: None,
            processing: None,
            broadcast: None,
            acceptor: None,
        })
    }

    /// Bind the listener and launch the pipeline threads.
    ///
    /// Frames from `source` are resampled to `out_width × out_height`
    /// before scanning. Returns the bound address (useful with
    /// port 0).
    pub fn start(
        &mut self,
        source: Box<dyn FrameSource>,
        out_width: u32,
        out_height: u32,
    ) -> Result<SocketAddr, LpxError> {
        if self.shared.running() {
            return Err(LpxError::Socket(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "server already running",
            )));
        }

        let listener =
            TcpListener::bind(("0.0.0.0", self.port)).map_err(LpxError::Socket)?;
        listener.set_nonblocking(true).map_err(LpxError::Socket)?;
        let local_addr = listener.local_addr().map_err(LpxError::Socket)?;

        self.shared.out_width.store(out_width, Ordering::Relaxed);
        self.shared.out_height.store(out_height, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::SeqCst);

        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("thread spawn")
        };

        let shared = Arc::clone(&self.shared);
        self.capture = Some(spawn(
            "lpx-capture",
            Box::new(move || capture_loop(shared, source)),
        ));

        let shared = Arc::clone(&self.shared);
        self.processing = Some(spawn(
            "lpx-processing",
            Box::new(move || processing_loop(shared)),
        ));

        let shared = Arc::clone(&self.shared);
        self.broadcast = Some(spawn(
            "lpx-broadcast",
            Box::new(move || broadcast_loop(shared)),
        ));

        let shared = Arc::clone(&self.shared);
        self.acceptor = Some(spawn(
            "lpx-acceptor",
            Box::new(move || acceptor_loop(shared, listener)),
        ));

        self.local_addr = Some(local_addr);
        info!(%local_addr, out_width, out_height, "stream server started");
        Ok(local_addr)
    }

    /// Cooperative shutdown; idempotent.
    ///
    /// Also reaps the threads after the pipeline wound itself down
    /// (a non-looping source reaching its end clears the running
    /// flag on its own).
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if self.broadcast.is_none()
            && self.acceptor.is_none()
            && self.capture.is_none()
            && self.processing.is_none()
        {
            return;
        }
        info!("stopping stream server");

        self.shared.frame_queue.close();
        self.shared.image_queue.close();

        // Broadcast and acceptor first, so nothing is touching the
        // client sockets when they close.
        for handle in [self.broadcast.take(), self.acceptor.take()] {
            if let Some(h) = handle {
                let _ = h.join();
            }
        }

        {
            let mut clients = self.shared.clients.lock().unwrap_or_else(|e| e.into_inner());
            for client in clients.drain(..) {
                let _ = client.stream.shutdown(Shutdown::Both);
            }
            self.shared.client_count.store(0, Ordering::SeqCst);
        }

        for handle in [self.capture.take(), self.processing.take()] {
            if let Some(h) = handle {
                let _ = h.join();
            }
        }
        info!("stream server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::SeqCst)
    }

    /// Enable or disable looping of file sources.
    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Relaxed);
    }

    /// Override the pacing rate for file sources.
    pub fn set_fps(&self, fps: f32) {
        store_f32(&self.shared.target_fps, fps);
    }

    /// Retune adaptive frame skipping for live sources.
    pub fn set_skip_rate(&self, min: u32, max: u32, motion_threshold: f32) {
        let min = min.max(1);
        let max = max.max(min);
        self.shared.min_skip.store(min, Ordering::Relaxed);
        self.shared.max_skip.store(max, Ordering::Relaxed);
        store_f32(&self.shared.motion_threshold, motion_threshold);
        let current = self.shared.skip_rate.load(Ordering::Relaxed);
        self.shared
            .skip_rate
            .store(current.clamp(min, max), Ordering::Relaxed);
    }

    /// Current fixation offset from frame centre.
    pub fn center_offset(&self) -> (f32, f32) {
        self.shared.center_offset()
    }

    /// Move the fixation point; clamped to ±0.2 × map width.
    pub fn set_center_offset(&self, x: f32, y: f32) {
        self.shared.set_center_offset(x, y);
    }

    /// Apply one movement command (`offset += delta × step`).
    pub fn handle_movement(&self, cmd: &MovementCommand) {
        self.shared.apply_movement(cmd);
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Pipeline threads ─────────────────────────────────────────────

fn capture_loop(shared: Arc<ServerShared>, mut source: Box<dyn FrameSource>) {
    let live = source.is_live();
    let out_width = shared.out_width.load(Ordering::Relaxed);
    let out_height = shared.out_height.load(Ordering::Relaxed);

    let mut previous_gray: Option<Vec<u8>> = None;
    let mut frame_count: u64 = 0;
    let mut last_frame = Instant::now();

    while shared.running() {
        // No point decoding for nobody.
        if shared.client_count.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }

        if shared.rewind_requested.swap(false, Ordering::Relaxed) {
            if let Err(e) = source.rewind() {
                warn!(error = %e, "rewind failed");
            } else {
                frame_count = 0;
            }
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if !live && shared.looping.load(Ordering::Relaxed) {
                    debug!("end of source, looping");
                    if source.rewind().is_err() {
                        warn!("loop rewind failed, capture exiting");
                        break;
                    }
                    continue;
                }
                info!("source ended, capture exiting");
                break;
            }
            Err(e) => {
                warn!(error = %e, "frame capture failed, capture exiting");
                break;
            }
        };
        frame_count += 1;

        if live {
            let skip = shared.skip_rate.load(Ordering::Relaxed).max(1) as u64;
            if frame_count % skip != 0 {
                continue;
            }
            let gray = frame.to_gray();
            let threshold = load_f32(&shared.motion_threshold);
            let moving = previous_gray
                .as_deref()
                .map(|prev| motion_score(&gray, prev) > threshold)
                .unwrap_or(true);
            previous_gray = Some(gray);
            if moving {
                shared.motion_seen.store(true, Ordering::Relaxed);
            }
            // A static scene only feeds an empty pipeline.
            if !moving && !shared.frame_queue.is_empty() {
                continue;
            }
        }

        let frame = if frame.width != out_width || frame.height != out_height {
            frame.resized(out_width, out_height)
        } else {
            frame
        };

        let dropped = shared.frame_queue.push(frame);
        if dropped > 0 {
            debug!(dropped, "frame queue overflow");
        }

        if !live {
            let fps = {
                let configured = load_f32(&shared.target_fps);
                if configured > 0.0 {
                    configured
                } else {
                    source.fps().max(1.0)
                }
            };
            let interval = Duration::from_secs_f32(1.0 / fps);
            let elapsed = last_frame.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
            last_frame = Instant::now();
        }
    }

    // A finished source winds the whole pipeline down: closing the
    // frame queue drains processing, which drains broadcast in turn.
    shared.frame_queue.close();
    shared.running.store(false, Ordering::SeqCst);
    debug!("capture thread exiting");
}

fn processing_loop(shared: Arc<ServerShared>) {
    while let Some(frame) = shared.frame_queue.pop() {
        if !shared.running() {
            break;
        }
        let (x_ofs, y_ofs) = shared.center_offset();
        let cx = frame.width as f32 / 2.0 + x_ofs;
        let cy = frame.height as f32 / 2.0 + y_ofs;

        let start = Instant::now();
        match shared.scanner.scan(&frame, cx, cy) {
            Ok(image) => {
                shared.record_scan_latency(start.elapsed());
                let dropped = shared.image_queue.push(image);
                if dropped > 0 {
                    debug!(dropped, "broadcast queue overflow");
                }
            }
            Err(e) => {
                // Drop the frame and keep the pipeline moving.
                warn!(error = %e, "scan failed, dropping frame");
            }
        }
    }
    shared.image_queue.close();
    debug!("processing thread exiting");
}

fn broadcast_loop(shared: Arc<ServerShared>) {
    while let Some(image) = shared.image_queue.pop() {
        if !shared.running() {
            break;
        }
        let payload = wire::encode_image(&image);
        let mut failed = Vec::new();

        for (id, mut stream) in shared.snapshot_clients() {
            // At most one command per client per broadcast cycle; it
            // takes effect on the next scanned frame.
            match wire::poll_command(&stream) {
                Ok(Some(cmd)) => shared.apply_movement(&cmd),
                Ok(None) => {}
                Err(e) => {
                    debug!(client = id, error = %e, "dropping client on command read");
                    failed.push(id);
                    continue;
                }
            }

            if let Err(e) =
                wire::write_all_retrying(&mut stream, &payload, || shared.running())
            {
                debug!(client = id, error = %e, "dropping client on frame write");
                failed.push(id);
            }
        }

        shared.remove_clients(&failed);
    }
    debug!("broadcast thread exiting");
}

fn acceptor_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    while shared.running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = prepare_client_socket(&stream) {
                    warn!(%peer, error = %e, "rejecting client, socket setup failed");
                    continue;
                }
                let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
                let count = {
                    let mut clients =
                        shared.clients.lock().unwrap_or_else(|e| e.into_inner());
                    clients.push(ClientRecord { id, stream });
                    clients.len()
                };
                shared.client_count.store(count, Ordering::SeqCst);
                info!(%peer, client = id, clients = count, "client connected");

                if count == 1 && shared.rewind_on_first_client {
                    shared.rewind_requested.store(true, Ordering::Relaxed);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                if shared.running() {
                    warn!(error = %e, "accept failed");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("acceptor thread exiting");
}

fn prepare_client_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_send_buffer_size(SEND_BUFFER_BYTES)?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spiral_tables;

    fn test_server() -> StreamServer {
        let tables = Arc::new(spiral_tables(256, 7.5, 5, 100));
        let config = ServerConfig {
            port: 0,
            target_fps: 60.0,
            looping: true,
            ..ServerConfig::default()
        };
        StreamServer::new(tables, config).unwrap()
    }

    #[test]
    fn movement_is_clamped_to_map_fraction() {
        let server = test_server();
        // 0.2 × 256 = 51.2
        server.set_center_offset(1000.0, -1000.0);
        let (x, y) = server.center_offset();
        assert!((x - 51.2).abs() < 1e-3);
        assert!((y + 51.2).abs() < 1e-3);

        server.set_center_offset(0.0, 0.0);
        for _ in 0..100 {
            server.handle_movement(&MovementCommand::new(1.0, 0.0, 10.0));
        }
        let (x, _) = server.center_offset();
        assert!(x <= 51.2 + 1e-3);
    }

    #[test]
    fn movement_applies_delta_times_step() {
        let server = test_server();
        server.handle_movement(&MovementCommand::new(1.0, -1.0, 10.0));
        let (x, y) = server.center_offset();
        assert!((x - 10.0).abs() < 1e-3);
        assert!((y + 10.0).abs() < 1e-3);
    }

    #[test]
    fn skip_rate_rises_when_slow() {
        let server = test_server();
        let shared = &server.shared;
        for _ in 0..20 {
            shared.record_scan_latency(Duration::from_millis(200));
        }
        assert_eq!(
            shared.skip_rate.load(Ordering::Relaxed),
            shared.max_skip.load(Ordering::Relaxed)
        );

        // Fast scans with motion pull it back down.
        for _ in 0..40 {
            shared.motion_seen.store(true, Ordering::Relaxed);
            shared.record_scan_latency(Duration::from_millis(1));
        }
        assert_eq!(
            shared.skip_rate.load(Ordering::Relaxed),
            shared.min_skip.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let mut server = test_server();
        server.stop();
        assert!(!server.is_running());
    }
}
