//! Framing for the GDB remote serial protocol
//!
//! Frames look like `$<payload>#<checksum>` where the checksum is the modulo 256 sum of
//! the payload bytes, written as two hex digits.

use std::fmt::Write;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::DeployError;

/// Sums the payload bytes modulo 256
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Wraps a payload in `$...#xx`
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload.as_bytes());
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(payload.as_bytes())).as_bytes());
    out
}

/// Hex-encodes bytes as an uppercase string
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02X}");
        output
    })
}

/// Decodes a hex string of either case
///
/// # Errors
/// `ProtocolViolation` on odd length or a non-hex character
pub fn hex_decode(hex: &str) -> Result<Vec<u8>, DeployError> {
    if hex.len() % 2 != 0 {
        return Err(DeployError::ProtocolViolation(format!(
            "odd length hex string {hex}"
        )));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| DeployError::ProtocolViolation(format!("invalid hex in {hex}")))
        })
        .collect()
}

/// Builds the payload of the `A` packet that sets the inferior's argv
///
/// Each argument becomes `<hex length>,<index>,<HEX>`, joined with commas. The first
/// argument is the program path.
///
/// # Errors
/// `InvalidArgument` if `argv` is empty
pub fn encode_argv(argv: &[String]) -> Result<String, DeployError> {
    if argv.is_empty() {
        return Err(DeployError::InvalidArgument);
    }
    let body = argv
        .iter()
        .enumerate()
        .map(|(i, arg)| format!("{},{i},{}", arg.len() * 2, hex_encode(arg.as_bytes())))
        .collect::<Vec<String>>()
        .join(",");
    Ok(format!("A{body}"))
}

/// Parses an `A` packet payload back into the argument strings
pub fn decode_argv(payload: &str) -> Result<Vec<String>, DeployError> {
    let body = payload
        .strip_prefix('A')
        .ok_or_else(|| DeployError::ProtocolViolation(payload.to_string()))?;
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() % 3 != 0 {
        return Err(DeployError::ProtocolViolation(payload.to_string()));
    }

    let mut argv = Vec::with_capacity(fields.len() / 3);
    for (expected_index, field) in fields.chunks(3).enumerate() {
        let len: usize = field[0]
            .parse()
            .map_err(|_| DeployError::ProtocolViolation(payload.to_string()))?;
        let index: usize = field[1]
            .parse()
            .map_err(|_| DeployError::ProtocolViolation(payload.to_string()))?;
        if len != field[2].len() || index != expected_index {
            return Err(DeployError::ProtocolViolation(payload.to_string()));
        }
        argv.push(String::from_utf8(hex_decode(field[2])?)?);
    }
    Ok(argv)
}

/// One unit read off the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// `+`, the peer accepted the last packet
    Ack,
    /// `-`, the peer wants the last packet again
    Nak,
    /// Payload of a `$...#xx` frame
    Frame(String),
}

/// Accumulates bytes read from the connection and yields acks and complete frames
///
/// A frame is only produced once the `#` and both checksum characters are buffered, so
/// partial frames survive across short reads. Other bytes before a `$` (the interrupt
/// byte, noise) are skipped.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next ack, nak or complete frame, if one is buffered
    ///
    /// # Errors
    /// * `ChecksumMismatch` if the trailing digits don't match the payload. The bad frame
    ///   is consumed.
    /// * `ProtocolViolation` if the checksum isn't hex
    pub fn next_packet(&mut self) -> Result<Option<Incoming>, DeployError> {
        let Some(start) = self
            .buf
            .iter()
            .position(|b| matches!(b, b'$' | b'+' | b'-'))
        else {
            if !self.buf.is_empty() {
                trace!("Skipping {:?}", String::from_utf8_lossy(&self.buf));
                self.buf.clear();
            }
            return Ok(None);
        };
        if start > 0 {
            trace!("Skipping {:?}", String::from_utf8_lossy(&self.buf[..start]));
            self.buf.advance(start);
        }
        match self.buf[0] {
            b'+' => {
                self.buf.advance(1);
                return Ok(Some(Incoming::Ack));
            }
            b'-' => {
                self.buf.advance(1);
                return Ok(Some(Incoming::Nak));
            }
            _ => {}
        }

        let Some(hash) = self.buf.iter().position(|b| *b == b'#') else {
            return Ok(None);
        };
        if self.buf.len() < hash + 3 {
            return Ok(None);
        }

        let frame = self.buf.split_to(hash + 3);
        let payload = &frame[1..hash];
        let digits = std::str::from_utf8(&frame[hash + 1..])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                DeployError::ProtocolViolation(format!(
                    "bad checksum digits in {}",
                    String::from_utf8_lossy(&frame)
                ))
            })?;

        let expected = checksum(payload);
        if expected != digits {
            return Err(DeployError::ChecksumMismatch {
                expected,
                actual: digits,
            });
        }
        Ok(Some(Incoming::Frame(String::from_utf8(payload.to_vec())?)))
    }
}
