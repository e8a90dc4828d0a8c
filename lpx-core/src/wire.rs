//! Binary wire protocol for LPX streaming over TCP.
//!
//! One TCP connection per client carries both directions: the server
//! writes length-prefixed image frames, the client writes fixed-size
//! movement commands. Frames are never interleaved with command
//! bytes — the server drains at most one pending command between
//! frame writes and never reads mid-frame.
//!
//! ## Server → client frame
//!
//! ```text
//! total_size: u32            bytes that follow
//! header:     8 × i32        length, n_max_cells, int(spiral_per),
//!                            width, height, x_ofs×1e5, y_ofs×1e5,
//!                            reserved (0)
//! cells:      length × u32   packed BGR cell values
//! ```
//!
//! On receipt the reader reconstitutes `spiral_per = int + 0.5` and
//! the offsets by `× 1e-5`.
//!
//! ## Client → server command
//!
//! ```text
//! type:      u32             only MOVEMENT (0x02) is accepted
//! delta_x:   f32
//! delta_y:   f32
//! step_size: f32
//! ```
//!
//! All integers and floats are little-endian.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::LpxError;
use crate::lp_image::LpImage;

// ── Constants ────────────────────────────────────────────────────

/// Default server port.
pub const DEFAULT_PORT: u16 = 5050;

/// Upper bound on a declared frame size; anything larger is a
/// framing error and must be rejected before allocation.
pub const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

/// Command discriminant for a movement command.
pub const CMD_MOVEMENT: u32 = 0x02;

/// Frame header length on the wire (8 × i32).
pub const HEADER_BYTES: usize = 32;

/// Full movement command length on the wire (type + 3 × f32).
pub const COMMAND_BYTES: usize = 16;

// ── MovementCommand ──────────────────────────────────────────────

/// A discrete fixation movement: `offset += delta × step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementCommand {
    pub delta_x: f32,
    pub delta_y: f32,
    pub step_size: f32,
}

impl MovementCommand {
    pub fn new(delta_x: f32, delta_y: f32, step_size: f32) -> Self {
        Self {
            delta_x,
            delta_y,
            step_size,
        }
    }

    /// Serialize including the leading type word.
    pub fn encode(&self) -> [u8; COMMAND_BYTES] {
        let mut buf = [0u8; COMMAND_BYTES];
        buf[0..4].copy_from_slice(&CMD_MOVEMENT.to_le_bytes());
        buf[4..8].copy_from_slice(&self.delta_x.to_le_bytes());
        buf[8..12].copy_from_slice(&self.delta_y.to_le_bytes());
        buf[12..16].copy_from_slice(&self.step_size.to_le_bytes());
        buf
    }

    /// Deserialize the 12-byte payload that follows the type word.
    pub fn decode_payload(data: &[u8]) -> Result<Self, LpxError> {
        if data.len() < 12 {
            return Err(LpxError::WireFraming(format!(
                "movement payload too short: {} < 12",
                data.len()
            )));
        }
        Ok(Self {
            delta_x: f32::from_le_bytes(data[0..4].try_into().expect("length checked")),
            delta_y: f32::from_le_bytes(data[4..8].try_into().expect("length checked")),
            step_size: f32::from_le_bytes(data[8..12].try_into().expect("length checked")),
        })
    }
}

// ── Frame encoding ───────────────────────────────────────────────

/// Serialize an image into one contiguous wire frame.
///
/// The broadcast loop encodes once and writes the same buffer to
/// every client.
pub fn encode_image(image: &LpImage) -> Vec<u8> {
    let length = image.length();
    let total_size = (HEADER_BYTES + length * 4) as u32;
    let (x_ofs, y_ofs) = image.offset();

    let mut buf = Vec::with_capacity(4 + total_size as usize);
    buf.extend_from_slice(&total_size.to_le_bytes());

    let header = [
        length as i32,
        image.max_cells() as i32,
        image.spiral_per() as i32,
        image.width() as i32,
        image.height() as i32,
        (x_ofs * 100_000.0) as i32,
        (y_ofs * 100_000.0) as i32,
        0,
    ];
    for v in header {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    for cell in &image.cells()[..length] {
        buf.extend_from_slice(&cell.to_le_bytes());
    }
    buf
}

/// Parse the payload that follows the `total_size` word.
pub fn parse_frame(payload: &[u8]) -> Result<LpImage, LpxError> {
    if payload.len() < HEADER_BYTES {
        return Err(LpxError::WireFraming(format!(
            "frame payload too short: {} < {HEADER_BYTES}",
            payload.len()
        )));
    }

    let word = |i: usize| {
        i32::from_le_bytes(
            payload[i * 4..i * 4 + 4]
                .try_into()
                .expect("length checked"),
        )
    };
    let length = word(0);
    let n_max_cells = word(1);
    let spiral_per = word(2) as f32 + 0.5;
    let width = word(3);
    let height = word(4);
    let x_ofs = word(5) as f32 * 1e-5;
    let y_ofs = word(6) as f32 * 1e-5;

    if length < 0 || n_max_cells < 0 || width < 0 || height < 0 {
        return Err(LpxError::WireFraming("negative header field".into()));
    }
    let cell_bytes = payload.len() - HEADER_BYTES;
    if cell_bytes != length as usize * 4 {
        return Err(LpxError::WireFraming(format!(
            "cell payload holds {cell_bytes} bytes, header declares {}",
            length as usize * 4
        )));
    }

    let cells = payload[HEADER_BYTES..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(LpImage::from_parts(
        length as usize,
        n_max_cells as usize,
        spiral_per,
        width as u32,
        height as u32,
        x_ofs,
        y_ofs,
        cells,
    ))
}

/// Read one complete frame from a blocking stream.
///
/// Validates the declared size *before* allocating. A short read is
/// reported as `WireFraming` — the peer disconnected mid-frame.
pub fn read_image(reader: &mut impl Read) -> Result<LpImage, LpxError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(map_short_read)?;
    let total_size = u32::from_le_bytes(len_buf);

    if total_size > MAX_FRAME_BYTES {
        return Err(LpxError::WireFraming(format!(
            "declared frame size {total_size} exceeds {MAX_FRAME_BYTES}"
        )));
    }
    if (total_size as usize) <= HEADER_BYTES {
        return Err(LpxError::WireFraming(format!(
            "declared frame size {total_size} not above header size"
        )));
    }

    let mut payload = vec![0u8; total_size as usize];
    reader.read_exact(&mut payload).map_err(map_short_read)?;
    parse_frame(&payload)
}

fn map_short_read(e: std::io::Error) -> LpxError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        LpxError::WireFraming("short read before end of frame".into())
    } else {
        LpxError::Io(e)
    }
}

// ── Command I/O ──────────────────────────────────────────────────

/// Send one movement command (viewer side, blocking stream).
pub fn send_movement(stream: &mut TcpStream, cmd: &MovementCommand) -> Result<(), LpxError> {
    stream.write_all(&cmd.encode())?;
    stream.flush()?;
    Ok(())
}

/// Drain at most one pending command from a non-blocking client
/// socket.
///
/// The command is only consumed once all of its bytes have arrived;
/// a partial command stays queued for the next broadcast cycle.
/// `Ok(None)` means no complete command is pending. An unknown type
/// word or a closed connection is an error — the caller drops the
/// client.
pub fn poll_command(stream: &TcpStream) -> Result<Option<MovementCommand>, LpxError> {
    let mut probe = [0u8; COMMAND_BYTES];
    let available = match stream.peek(&mut probe) {
        Ok(0) => {
            return Err(LpxError::WireFraming("client closed connection".into()));
        }
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(LpxError::Io(e)),
    };

    if available < 4 {
        return Ok(None);
    }

    let cmd_type = u32::from_le_bytes(probe[0..4].try_into().expect("length checked"));
    if cmd_type != CMD_MOVEMENT {
        return Err(LpxError::WireFraming(format!(
            "unexpected command type {cmd_type:#x}"
        )));
    }
    if available < COMMAND_BYTES {
        // Payload still in flight.
        return Ok(None);
    }

    let mut buf = [0u8; COMMAND_BYTES];
    (&*stream).read_exact(&mut buf)?;
    MovementCommand::decode_payload(&buf[4..]).map(Some)
}

/// Write a full buffer to a non-blocking stream, spinning through
/// `WouldBlock` while `keep_going` holds.
pub fn write_all_retrying(
    stream: &mut TcpStream,
    mut bytes: &[u8],
    keep_going: impl Fn() -> bool,
) -> Result<(), LpxError> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => {
                return Err(LpxError::WireFraming("client closed connection".into()));
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if !keep_going() {
                    return Err(LpxError::WireFraming("write abandoned at shutdown".into()));
                }
                std::thread::sleep(std::time::Duration::from_micros(500));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(LpxError::Io(e)),
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp_image::pack_bgr;
    use crate::testutil::tiny_tables;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn sample_image() -> LpImage {
        let tables = Arc::new(tiny_tables());
        let mut img = LpImage::new(&tables, 64, 48).unwrap();
        img.set_length(img.max_cells());
        img.set_offset(3.5, -7.25);
        for (i, cell) in img.cells_mut().iter_mut().enumerate() {
            *cell = pack_bgr((i % 256) as u8, 128, 200);
        }
        img
    }

    #[test]
    fn frame_roundtrip_bit_exact() {
        let img = sample_image();
        let bytes = encode_image(&img);
        let decoded = read_image(&mut bytes.as_slice()).unwrap();

        assert_eq!(decoded.length(), img.length());
        assert_eq!(decoded.max_cells(), img.max_cells());
        assert_eq!(decoded.spiral_per(), img.spiral_per());
        assert_eq!(decoded.width(), img.width());
        assert_eq!(decoded.height(), img.height());
        let (x, y) = decoded.offset();
        assert!((x - 3.5).abs() < 1e-4);
        assert!((y + 7.25).abs() < 1e-4);
        assert_eq!(decoded.cells()[..decoded.length()], img.cells()[..img.length()]);
    }

    #[test]
    fn oversized_frame_rejected_before_allocation() {
        // 2^31 - 1 declared bytes with nothing behind it.
        let bytes = [0xFF, 0xFF, 0xFF, 0x7F];
        let err = read_image(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, LpxError::WireFraming(_)));
    }

    #[test]
    fn undersized_frame_rejected() {
        let bytes = 4u32.to_le_bytes();
        let err = read_image(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, LpxError::WireFraming(_)));
    }

    #[test]
    fn header_only_frame_rejected() {
        // total_size == header size: a zero-cell frame, which the
        // protocol does not allow.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(HEADER_BYTES as u32).to_le_bytes());
        bytes.extend_from_slice(&[0u8; HEADER_BYTES]);
        let err = read_image(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, LpxError::WireFraming(_)));
    }

    #[test]
    fn short_read_is_framing_error() {
        let img = sample_image();
        let bytes = encode_image(&img);
        let truncated = &bytes[..bytes.len() / 2];
        let err = read_image(&mut &truncated[..]).unwrap_err();
        assert!(matches!(err, LpxError::WireFraming(_)));
    }

    #[test]
    fn movement_roundtrip() {
        let cmd = MovementCommand::new(1.0, -1.0, 10.0);
        let bytes = cmd.encode();
        assert_eq!(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            CMD_MOVEMENT
        );
        let decoded = MovementCommand::decode_payload(&bytes[4..]).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn poll_command_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        // Nothing pending yet.
        assert!(poll_command(&server_side).unwrap().is_none());

        send_movement(&mut client, &MovementCommand::new(1.0, 0.0, 10.0)).unwrap();
        // Allow delivery on loopback.
        let cmd = loop {
            if let Some(cmd) = poll_command(&server_side).unwrap() {
                break cmd;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        assert_eq!(cmd.delta_x, 1.0);
        assert_eq!(cmd.step_size, 10.0);

        // Unknown type word drops the client.
        use std::io::Write as _;
        client.write_all(&0xDEADu32.to_le_bytes()).unwrap();
        client.write_all(&[0u8; 12]).unwrap();
        let err = loop {
            match poll_command(&server_side) {
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Ok(Some(_)) => panic!("bogus command accepted"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, LpxError::WireFraming(_)));
    }

    #[test]
    fn poll_command_detects_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        drop(client);

        let err = loop {
            match poll_command(&server_side) {
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Ok(Some(_)) => panic!("command from closed peer"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, LpxError::WireFraming(_)));
    }
}
