//! Frame producers feeding the capture stage.
//!
//! The pipeline is agnostic to where frames come from; anything that
//! implements [`FrameSource`] can drive a server. Concrete video and
//! camera sources live outside the core — the core ships only the
//! synthetic test-pattern source used by demos and the test suites.

use crate::error::LpxError;

/// One raster frame, tightly packed row-major bytes.
///
/// `channels` is 1 (grayscale) or 3 (BGR, blue first — the byte
/// order the scanner accumulates in).
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Validate geometry against the data length.
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self, LpxError> {
        if width == 0 || height == 0 || data.is_empty() {
            return Err(LpxError::InvalidFrame("empty frame".into()));
        }
        if channels != 1 && channels != 3 {
            return Err(LpxError::InvalidFrame(format!(
                "unsupported channel count {channels}"
            )));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(LpxError::InvalidFrame(format!(
                "buffer holds {} bytes, geometry needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Sample the pixel at `(x, y)` as BGR; grayscale frames
    /// replicate the intensity across all three channels.
    #[inline]
    pub fn bgr_at(&self, x: i32, y: i32) -> Option<[u8; 3]> {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * self.channels as usize;
        Some(match self.channels {
            1 => {
                let v = self.data[idx];
                [v, v, v]
            }
            _ => [self.data[idx], self.data[idx + 1], self.data[idx + 2]],
        })
    }

    /// Luma plane (ITU-R BT.601 weights), used for motion scoring.
    pub fn to_gray(&self) -> Vec<u8> {
        let pixels = self.width as usize * self.height as usize;
        let mut gray = Vec::with_capacity(pixels);
        match self.channels {
            1 => gray.extend_from_slice(&self.data),
            _ => {
                for px in self.data.chunks_exact(3) {
                    let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                    gray.push(((299 * r + 587 * g + 114 * b) / 1000) as u8);
                }
            }
        }
        gray
    }

    /// Resample to `(width, height)` with a triangle filter.
    ///
    /// Channels are interpolated independently, so the stored byte
    /// order does not matter to the resampler.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        use image::imageops::{self, FilterType};

        if width == self.width && height == self.height {
            return self.clone();
        }

        let data = match self.channels {
            1 => {
                let img = image::GrayImage::from_raw(self.width, self.height, self.data.clone())
                    .expect("frame geometry already validated");
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
            _ => {
                let img = image::RgbImage::from_raw(self.width, self.height, self.data.clone())
                    .expect("frame geometry already validated");
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
        };

        Frame {
            width,
            height,
            channels: self.channels,
            data,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Mean absolute difference between two luma planes of equal size.
pub fn motion_score(current: &[u8], previous: &[u8]) -> f32 {
    let len = current.len().min(previous.len());
    if len == 0 {
        return 0.0;
    }
    let sum: u64 = current[..len]
        .iter()
        .zip(&previous[..len])
        .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs() as u64)
        .sum();
    sum as f32 / len as f32
}

// ── FrameSource ──────────────────────────────────────────────────

/// A producer of raster frames.
///
/// `next_frame` returning `Ok(None)` means the source is exhausted
/// (a non-looping file reached its end). Live sources never return
/// `None`; they block in the driver instead.
pub trait FrameSource: Send {
    /// Produce the next frame.
    fn next_frame(&mut self) -> Result<Option<Frame>, LpxError>;

    /// Seek back to the first frame. Live sources treat this as a
    /// no-op.
    fn rewind(&mut self) -> Result<(), LpxError> {
        Ok(())
    }

    /// Native frame rate, for wall-clock pacing.
    fn fps(&self) -> f32 {
        30.0
    }

    /// Whether frames arrive in real time (webcam) rather than on
    /// demand (file).
    fn is_live(&self) -> bool {
        false
    }

    /// Native dimensions, when known up front.
    fn dimensions(&self) -> Option<(u32, u32)> {
        None
    }
}

// ── SyntheticSource ──────────────────────────────────────────────

/// Deterministic moving-gradient source for demos and tests.
///
/// Every frame is a diagonal BGR gradient shifted by one pixel per
/// frame, so consecutive frames always differ and individual frames
/// are reproducible from their index.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: f32,
    frame_index: u64,
    frame_limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f32) -> Self {
        Self {
            width,
            height,
            fps,
            frame_index: 0,
            frame_limit: None,
        }
    }

    /// Stop producing after `limit` frames (simulates a short file).
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Deterministic pixel value for frame `t` at `(x, y)`.
    pub fn pixel_at(t: u64, x: u32, y: u32) -> [u8; 3] {
        let shift = (t % 256) as u32;
        let b = ((x + shift) % 256) as u8;
        let g = ((y + shift) % 256) as u8;
        let r = ((x + y) % 256) as u8;
        [b, g, r]
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, LpxError> {
        if let Some(limit) = self.frame_limit {
            if self.frame_index >= limit {
                return Ok(None);
            }
        }
        let t = self.frame_index;
        self.frame_index += 1;

        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&Self::pixel_at(t, x, y));
            }
        }
        Ok(Some(Frame::new(self.width, self.height, 3, data)?))
    }

    fn rewind(&mut self) -> Result<(), LpxError> {
        self.frame_index = 0;
        Ok(())
    }

    fn fps(&self) -> f32 {
        self.fps
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        assert!(Frame::new(0, 10, 3, vec![0; 30]).is_err());
        assert!(Frame::new(2, 2, 2, vec![0; 8]).is_err());
        assert!(Frame::new(2, 2, 3, vec![0; 11]).is_err());
    }

    #[test]
    fn grayscale_replicates_channels() {
        let frame = Frame::new(2, 1, 1, vec![10, 200]).unwrap();
        assert_eq!(frame.bgr_at(0, 0), Some([10, 10, 10]));
        assert_eq!(frame.bgr_at(1, 0), Some([200, 200, 200]));
        assert_eq!(frame.bgr_at(2, 0), None);
        assert_eq!(frame.bgr_at(-1, 0), None);
    }

    #[test]
    fn motion_score_zero_for_identical() {
        let a = vec![7u8; 100];
        assert_eq!(motion_score(&a, &a), 0.0);

        let b = vec![17u8; 100];
        assert_eq!(motion_score(&a, &b), 10.0);
    }

    #[test]
    fn synthetic_source_is_deterministic() {
        let mut a = SyntheticSource::new(8, 8, 30.0);
        let mut b = SyntheticSource::new(8, 8, 30.0);
        let fa = a.next_frame().unwrap().unwrap();
        let fb = b.next_frame().unwrap().unwrap();
        assert_eq!(fa.data, fb.data);
    }

    #[test]
    fn synthetic_source_honours_limit_and_rewind() {
        let mut src = SyntheticSource::new(4, 4, 30.0).with_frame_limit(2);
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_none());
        src.rewind().unwrap();
        assert!(src.next_frame().unwrap().is_some());
    }

    #[test]
    fn resize_keeps_uniform_color() {
        let frame = Frame::new(8, 8, 3, vec![100; 8 * 8 * 3]).unwrap();
        let small = frame.resized(4, 4);
        assert_eq!(small.width, 4);
        assert!(small.data.iter().all(|&v| v == 100));
    }
}
