//! Webcam source backed by `nokhwa`.
//!
//! Frames come out of the camera as RGB and are swapped to the BGR
//! order the scanner accumulates in. The camera blocks in the driver
//! between frames, so this source is "live": the capture stage
//! applies motion-adaptive skipping instead of wall-clock pacing.

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use tracing::info;

use lpx_core::{Frame, FrameSource, LpxError};

/// A live camera feed.
pub struct WebcamSource {
    camera: Camera,
    width: u32,
    height: u32,
    fps: f32,
}

impl WebcamSource {
    /// Open camera `index` and start its stream.
    pub fn open(index: u32) -> Result<Self, LpxError> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);
        let mut camera = Camera::new(CameraIndex::Index(index), requested)
            .map_err(|e| LpxError::Source(format!("cannot open camera {index}: {e}")))?;
        camera
            .open_stream()
            .map_err(|e| LpxError::Source(format!("cannot start camera stream: {e}")))?;

        let resolution = camera.resolution();
        let width = resolution.width();
        let height = resolution.height();
        let fps = camera.frame_rate() as f32;
        info!(index, width, height, fps, "opened webcam");

        Ok(Self {
            camera,
            width,
            height,
            fps,
        })
    }
}

impl FrameSource for WebcamSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, LpxError> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| LpxError::Source(format!("camera frame failed: {e}")))?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| LpxError::Source(format!("camera frame decode failed: {e}")))?;

        let (width, height) = decoded.dimensions();
        let rgb = decoded.into_raw();
        let mut bgr = Vec::with_capacity(rgb.len());
        for px in rgb.chunks_exact(3) {
            bgr.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        Frame::new(width, height, 3, bgr).map(Some)
    }

    fn fps(&self) -> f32 {
        if self.fps > 0.0 {
            self.fps
        } else {
            30.0
        }
    }

    fn is_live(&self) -> bool {
        true
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        let _ = self.camera.stop_stream();
    }
}
