//! Stream framing for Meshtastic serial and TCP links.
//!
//! Each protocol message on a byte stream is emitted as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything between frames is the device's debug console output. The decoder can be fed
//! arbitrary chunks and yields whole frames and complete console lines as they become
//! available. A header with a zero or oversize length is treated as noise and the decoder
//! resynchronizes by advancing one byte.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
/// Largest protobuf payload the firmware accepts in a single frame.
pub const MAX_PAYLOAD: usize = 512;
/// Console bytes are flushed as a line once this many accumulate without a newline.
const MAX_CONSOLE_LINE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte frame limit")]
pub struct FrameTooLarge(pub usize);

/// Wrap one encoded protocol message in the stream header.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameTooLarge> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(START1);
    out.put_u8(START2);
    out.put_u16(payload.len() as u16);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Bytes),
    Console(String),
}

#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    console: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            console: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame or console line, if any.
    pub fn next_item(&mut self) -> Option<Decoded> {
        loop {
            if let Some(line) = self.take_console_line() {
                return Some(Decoded::Console(line));
            }
            if self.buf.is_empty() {
                return None;
            }

            if self.buf[0] != START1 {
                let skip = self
                    .buf
                    .iter()
                    .position(|&b| b == START1)
                    .unwrap_or(self.buf.len());
                let noise = self.buf.split_to(skip);
                self.console.extend_from_slice(&noise);
                continue;
            }

            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            return Some(Decoded::Frame(self.buf.split_to(declared).freeze()));
        }
    }

    fn take_console_line(&mut self) -> Option<String> {
        let end = match self.console.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.console.len() >= MAX_CONSOLE_LINE => self.console.len(),
            None => return None,
        };
        let raw: Vec<u8> = self.console.drain(..end).collect();
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if line.is_empty() {
            return self.take_console_line();
        }
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(b"hello").expect("encode");
        let mut dec = FrameDecoder::new();
        dec.push(&frame[..3]);
        assert_eq!(dec.next_item(), None);
        dec.push(&frame[3..]);
        assert_eq!(
            dec.next_item(),
            Some(Decoded::Frame(Bytes::from_static(b"hello")))
        );
        assert_eq!(dec.next_item(), None);
    }

    #[test]
    fn console_text_between_frames() {
        let mut dec = FrameDecoder::new();
        dec.push(b"DEBUG | boot ok\r\n");
        dec.push(&encode_frame(&[1, 2, 3]).expect("encode"));
        assert_eq!(
            dec.next_item(),
            Some(Decoded::Console("DEBUG | boot ok".into()))
        );
        assert_eq!(
            dec.next_item(),
            Some(Decoded::Frame(Bytes::from_static(&[1, 2, 3])))
        );
    }

    #[test]
    fn oversize_header_resyncs() {
        let mut dec = FrameDecoder::new();
        dec.push(&[START1, START2, 0x7f, 0xff]);
        dec.push(&encode_frame(&[9]).expect("encode"));
        assert_eq!(
            dec.next_item(),
            Some(Decoded::Frame(Bytes::from_static(&[9])))
        );
    }

    #[test]
    fn encode_rejects_large_payloads() {
        assert_eq!(
            encode_frame(&[0u8; MAX_PAYLOAD + 1]),
            Err(FrameTooLarge(MAX_PAYLOAD + 1))
        );
        let ok = encode_frame(&[0u8; MAX_PAYLOAD]).expect("max fits");
        assert_eq!(&ok[..4], &[START1, START2, 0x02, 0x00]);
    }
}
