//! SLIP byte-stuffing codec plus link-frame fragmentation.
//!
//! A packet is SLIP-encoded then split into frames of at most 32 bytes on
//! the wire: 2 header bytes (`[n_frames, frame_index]`) followed by up to
//! 30 bytes of SLIP-encoded content. The last frame's content ends with the
//! SLIP `END` byte.

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

const FRAME_CONTENT_LEN: usize = 30;

/// SLIP-encode `packet`, then split the result into link frames of up to
/// `FRAME_CONTENT_LEN` content bytes, each carrying its own `[n, i]` header.
pub fn encode_frames(packet: &[u8]) -> Vec<Vec<u8>> {
    let mut encoded = Vec::with_capacity(packet.len() + 2);
    for &b in packet {
        match b {
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            other => encoded.push(other),
        }
    }
    encoded.push(END);

    let n_frames = encoded.len().div_ceil(FRAME_CONTENT_LEN).max(1);
    let mut frames = Vec::with_capacity(n_frames);
    for (i, chunk) in encoded.chunks(FRAME_CONTENT_LEN).enumerate() {
        let mut frame = Vec::with_capacity(chunk.len() + 2);
        frame.push(n_frames as u8);
        frame.push(i as u8);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    frames
}

/// Streaming SLIP decoder state. Consumes inbound chunks (each still
/// carrying its 2-byte link-frame header), strips the header, and
/// accumulates a decoded packet until an `END` byte terminates it.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    escaped: bool,
    started: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk (with its 2-byte frame header still attached).
    /// Returns `Some(packet)` once an `END` byte completes a non-empty
    /// accumulated buffer.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let content = if chunk.len() > 2 { &chunk[2..] } else { &[] };
        for &b in content {
            if self.escaped {
                self.escaped = false;
                match b {
                    ESC_END => self.buf.push(END),
                    ESC_ESC => self.buf.push(ESC),
                    other => self.buf.push(other),
                }
                self.started = true;
                continue;
            }
            match b {
                END => {
                    if self.started && !self.buf.is_empty() {
                        let out = std::mem::take(&mut self.buf);
                        self.started = false;
                        return Some(out);
                    }
                    // leading END: ignore
                }
                ESC => self.escaped = true,
                other => {
                    self.buf.push(other);
                    self.started = true;
                }
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.escaped = false;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_via_frames_and_decoder() {
        let packet = vec![0x01, 0xFF, 0x05, 0x00, 1, 2, 3, 4];
        let frames = encode_frames(&packet);
        let mut decoder = SlipDecoder::new();
        let mut out = None;
        for frame in &frames {
            if let Some(p) = decoder.feed(frame) {
                out = Some(p);
            }
        }
        assert_eq!(out.unwrap(), packet);
    }

    #[test]
    fn only_final_frame_ends_with_end_byte() {
        let packet = vec![0xAAu8; 100];
        let frames = encode_frames(&packet);
        assert!(frames.len() > 1);
        for frame in &frames[..frames.len() - 1] {
            let content = &frame[2..];
            assert!(!content.contains(&END), "non-final frame contains raw END");
        }
        let last = frames.last().unwrap();
        assert_eq!(*last.last().unwrap(), END);
    }

    #[test]
    fn escapes_end_and_esc_bytes() {
        let packet = vec![0xC0, 0xDB, 0x00, 0xFF];
        let frames = encode_frames(&packet);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame[0], 1); // n_frames
        assert_eq!(frame[1], 0); // frame_index
        assert_eq!(
            &frame[2..],
            &[ESC, ESC_END, ESC, ESC_ESC, 0x00, 0xFF, END][..]
        );

        let mut decoder = SlipDecoder::new();
        let decoded = decoder.feed(frame).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn leading_end_bytes_are_ignored() {
        let mut decoder = SlipDecoder::new();
        let chunk = vec![0, 0, END, END, 1, 2, END];
        let decoded = decoder.feed(&chunk).unwrap();
        assert_eq!(decoded, vec![1, 2]);
    }

    #[test]
    fn frame_count_matches_ceil_division() {
        let packet = vec![0u8; 61];
        let frames = encode_frames(&packet);
        // encoded len = 62 (packet + END byte), ceil(62/30) = 3
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame[0] as usize, frames.len());
        }
    }
}
