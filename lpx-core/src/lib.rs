//! Log-polar retinal video: scan, render, and stream.
//!
//! The pipeline turns conventional raster frames into a space-variant
//! retinal representation — tens of thousands of cells packed densely
//! around a movable fixation point and exponentially sparser toward
//! the periphery — and broadcasts the cell stream to TCP clients that
//! can steer the fixation with movement commands.

mod client;
mod error;
mod lp_image;
mod queue;
mod render;
mod scan;
mod server;
mod source;
mod spiral;
mod tables;
mod wire;

#[doc(hidden)]
pub mod testutil;

pub use client::{FrameStats, ViewerClient, ViewerConfig, KEY_THROTTLE_MS};
pub use error::LpxError;
pub use lp_image::{pack_bgr, unpack_bgr, LpImage};
pub use queue::BoundedQueue;
pub use render::{Raster, Renderer, SKIP_CELL};
pub use scan::{ScanCache, Scanner};
pub use server::{ServerConfig, StreamServer};
pub use source::{motion_score, Frame, FrameSource, SyntheticSource};
pub use spiral::{cell_array_offset, cell_index_of, spiral_radius};
pub use tables::{PositionPair, ScanTables};
pub use wire::{
    encode_image, parse_frame, poll_command, read_image, send_movement, MovementCommand,
    CMD_MOVEMENT, DEFAULT_PORT, MAX_FRAME_BYTES,
};
