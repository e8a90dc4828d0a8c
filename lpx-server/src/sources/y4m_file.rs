//! YUV4MPEG2 file source.
//!
//! Decoding of compressed containers is out of scope; files are
//! supplied in the uncompressed Y4M interchange format
//! (`ffmpeg -i clip.mp4 clip.y4m`). Frames are converted to BGR with
//! the BT.601 limited-range matrix. Rewinding reopens the decoder —
//! Y4M has no index to seek through.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::info;
use y4m::Colorspace;

use lpx_core::{Frame, FrameSource, LpxError};

/// Chroma plane geometry for a subsampled colorspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chroma {
    Mono,
    /// 4:2:0 — chroma halved in both axes.
    Quarter,
    /// 4:2:2 — chroma halved horizontally.
    Half,
    /// 4:4:4 — full-resolution chroma.
    Full,
}

fn classify(colorspace: Colorspace) -> Result<Chroma, LpxError> {
    match colorspace {
        Colorspace::Cmono => Ok(Chroma::Mono),
        Colorspace::C420 | Colorspace::C420jpeg | Colorspace::C420paldv | Colorspace::C420mpeg2 => {
            Ok(Chroma::Quarter)
        }
        Colorspace::C422 => Ok(Chroma::Half),
        Colorspace::C444 => Ok(Chroma::Full),
        other => Err(LpxError::Source(format!(
            "unsupported y4m colorspace {other:?}"
        ))),
    }
}

#[inline]
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [
        b.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        r.clamp(0, 255) as u8,
    ]
}

/// A video file played back as a sequence of BGR frames.
pub struct Y4mFileSource {
    path: PathBuf,
    decoder: y4m::Decoder<BufReader<File>>,
    width: u32,
    height: u32,
    fps: f32,
    chroma: Chroma,
}

impl Y4mFileSource {
    /// Open a `.y4m` file and parse its stream header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LpxError> {
        let path = path.as_ref().to_path_buf();
        let decoder = Self::new_decoder(&path)?;

        let width = decoder.get_width() as u32;
        let height = decoder.get_height() as u32;
        if width == 0 || height == 0 {
            return Err(LpxError::Source(format!(
                "{}: degenerate frame size {width}x{height}",
                path.display()
            )));
        }
        let rate = decoder.get_framerate();
        let fps = if rate.den > 0 {
            rate.num as f32 / rate.den as f32
        } else {
            30.0
        };
        let chroma = classify(decoder.get_colorspace())?;

        info!(
            path = %path.display(),
            width, height, fps,
            colorspace = ?decoder.get_colorspace(),
            "opened y4m source"
        );
        Ok(Self {
            path,
            decoder,
            width,
            height,
            fps,
            chroma,
        })
    }

    fn new_decoder(path: &Path) -> Result<y4m::Decoder<BufReader<File>>, LpxError> {
        let file = File::open(path)
            .map_err(|e| LpxError::Source(format!("cannot open {}: {e}", path.display())))?;
        y4m::Decoder::new(BufReader::new(file))
            .map_err(|e| LpxError::Source(format!("{}: bad y4m header: {e}", path.display())))
    }

}

fn convert_frame(
    width: u32,
    height: u32,
    chroma: Chroma,
    frame: &y4m::Frame<'_>,
) -> Result<Frame, LpxError> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = frame.get_y_plane();
    if y_plane.len() < w * h {
        return Err(LpxError::Source("y4m luma plane truncated".into()));
    }

    if chroma == Chroma::Mono {
        return Frame::new(width, height, 1, y_plane[..w * h].to_vec());
    }

    let (cw, ch) = match chroma {
        Chroma::Quarter => ((w + 1) / 2, (h + 1) / 2),
        Chroma::Half => ((w + 1) / 2, h),
        _ => (w, h),
    };
    let u_plane = frame.get_u_plane();
    let v_plane = frame.get_v_plane();
    if u_plane.len() < cw * ch || v_plane.len() < cw * ch {
        return Err(LpxError::Source("y4m chroma plane truncated".into()));
    }

    let mut data = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let cy_row = if chroma == Chroma::Quarter { row / 2 } else { row };
        for col in 0..w {
            let cx = if chroma == Chroma::Full { col } else { col / 2 };
            let ci = cy_row * cw + cx;
            let bgr = yuv_to_bgr(y_plane[row * w + col], u_plane[ci], v_plane[ci]);
            data.extend_from_slice(&bgr);
        }
    }
    Frame::new(width, height, 3, data)
}

impl FrameSource for Y4mFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, LpxError> {
        let (width, height, chroma) = (self.width, self.height, self.chroma);
        match self.decoder.read_frame() {
            Ok(frame) => convert_frame(width, height, chroma, &frame).map(Some),
            Err(y4m::Error::EOF) => Ok(None),
            Err(e) => Err(LpxError::Source(format!("frame decode failed: {e}"))),
        }
    }

    fn rewind(&mut self) -> Result<(), LpxError> {
        self.decoder = Self::new_decoder(&self.path)?;
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
    use std::io::Write;

    /// Minimal two-frame 4×2 C444 stream with known plane values.
    fn write_sample(path: &Path, frames: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(b"YUV4MPEG2 W4 H2 F25:1 Ip A1:1 C444\n")
            .unwrap();
        for t in 0..frames {
            file.write_all(b"FRAME\n").unwrap();
            // Y, then U, then V planes: 8 bytes each.
            file.write_all(&[(16 + t as u8 * 10); 8]).unwrap();
            file.write_all(&[128; 8]).unwrap();
            file.write_all(&[128; 8]).unwrap();
        }
    }

    #[test]
    fn decodes_frames_and_hits_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.y4m");
        write_sample(&path, 2);

        let mut source = Y4mFileSource::open(&path).unwrap();
        assert_eq!(source.dimensions(), Some((4, 2)));
        assert!((source.fps() - 25.0).abs() < 1e-3);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.width, 4);
        assert_eq!(first.channels, 3);
        // Y=16, U=V=128 is black in the limited-range matrix.
        assert_eq!(first.bgr_at(0, 0), Some([0, 0, 0]));

        let second = source.next_frame().unwrap().unwrap();
        // Y=26 lifts all channels equally (grey).
        let [b, g, r] = second.bgr_at(0, 0).unwrap();
        assert_eq!(b, g);
        assert_eq!(g, r);
        assert!(b > 0);

        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn rewind_reopens_from_frame_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.y4m");
        write_sample(&path, 2);

        let mut source = Y4mFileSource::open(&path).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let _ = source.next_frame().unwrap().unwrap();
        assert!(source.next_frame().unwrap().is_none());

        source.rewind().unwrap();
        let again = source.next_frame().unwrap().unwrap();
        assert_eq!(again.data, first.data);
    }

    #[test]
    fn missing_file_is_source_error() {
        let err = Y4mFileSource::open("/nonexistent/clip.y4m").unwrap_err();
        assert!(matches!(err, LpxError::Source(_)));
    }
}
