//! Concrete frame sources for the LPX streaming servers.
//!
//! The core pipeline only knows the [`FrameSource`] trait; this crate
//! provides the two production sources — YUV4MPEG2 video files and
//! `nokhwa`-backed webcams — plus the logging bootstrap the server
//! binaries share.
//!
//! [`FrameSource`]: lpx_core::FrameSource

pub mod sources;

use tracing_subscriber::EnvFilter;

/// Initialise stdout logging, honouring `RUST_LOG` when set.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
