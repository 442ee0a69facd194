//! Binary-hex stream decoder (`format bin_hexa`).
//!
//! A measurement is two bytes:
//!
//! ```text
//! byte 1: [neg_pow16 (4 bits)][magnitude 11:8]
//! byte 2: [magnitude 7:0]
//! value = magnitude / 16^neg_pow16
//! ```
//!
//! `neg_pow16 == 0xF` is reserved, so no sample starts with `0xFx`. Metadata
//! frames start with `0xF0`, carry their type in the second byte (`0xF1..=0xFF`)
//! and end with `0xFF 0xFF`:
//!
//! | type | body                     | meaning               |
//! |------|--------------------------|-----------------------|
//! | F1   | ASCII                    | error message         |
//! | F2   | ASCII                    | info message          |
//! | F3   | 4 B ms (BE), 1 B percent | timestamp             |
//! | F4   | -                        | end of acquisition    |
//! | F5   | -                        | overcurrent           |
//! | F6   | -                        | target powered down   |
//! | F7   | 2 B mV (BE)              | voltage               |

use log::{debug, info, warn};

use crate::batch::{DecodedBatch, Timestamp};

const META_START: u8 = 0xF0;
const TERMINATOR: [u8; 2] = [0xFF, 0xFF];

const META_ERROR: u8 = 0xF1;
const META_INFO: u8 = 0xF2;
const META_TIMESTAMP: u8 = 0xF3;
const META_END: u8 = 0xF4;
const META_OVERCURRENT: u8 = 0xF5;
const META_POWER_DOWN: u8 = 0xF6;
const META_VOLTAGE: u8 = 0xF7;

/// Header + 4 B time + 1 B percent + terminator.
const TIMESTAMP_FRAME_LEN: usize = 9;
/// Header + terminator.
const FLAG_FRAME_LEN: usize = 4;
/// Header + 2 B millivolts + terminator.
const VOLTAGE_FRAME_LEN: usize = 6;

/// Outcome of looking at a metadata frame at the cursor.
#[derive(Debug, PartialEq, Eq)]
enum Meta {
    /// Not enough bytes yet; leave everything from the frame start buffered.
    Incomplete,
    /// Frame handled; advance by this many bytes.
    Consumed(usize),
    /// End-of-acquisition frame of this length; stop decoding after it.
    End(usize),
}

/// Decode one regular 2-byte sample.
///
/// With `neg_pow16 == 0` the raw magnitude is the reading, unscaled.
pub fn decode_sample(hi: u8, lo: u8) -> f64 {
    let neg_pow = hi >> 4;
    let magnitude = f64::from((u16::from(hi & 0x0F) << 8) | u16::from(lo));
    if neg_pow > 0 {
        magnitude / 16f64.powi(i32::from(neg_pow))
    } else {
        magnitude
    }
}

/// Incremental decoder for the binary-hex stream.
///
/// Unconsumed bytes (a half sample, a frame still missing its tail, or bytes
/// after an end-of-acquisition frame) are kept for the next call.
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    buf: Vec<u8>,
}

impl BinaryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the carry-over. Call on every new acquisition session.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Hand the carry-over to the caller, leaving the decoder empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn feed(&mut self, data: &[u8]) -> DecodedBatch {
        self.buf.extend_from_slice(data);
        let mut batch = DecodedBatch::default();

        let mut pos = 0;
        while pos + 1 < self.buf.len() {
            let b1 = self.buf[pos];
            let b2 = self.buf[pos + 1];

            if b1 == META_START && b2 & 0xF0 == 0xF0 {
                match parse_meta(&self.buf[pos..], &mut batch) {
                    Meta::Incomplete => break,
                    Meta::Consumed(len) => pos += len,
                    Meta::End(len) => {
                        pos += len;
                        break;
                    }
                }
                continue;
            }

            if b1 >> 4 == 0x0F {
                // Stray reserved byte outside a frame header.
                debug!("skipping stray byte {:#04X}", b1);
                pos += 1;
                continue;
            }

            batch.samples.push(decode_sample(b1, b2));
            pos += 2;
        }

        self.buf.drain(..pos);
        batch
    }
}

/// Interpret the metadata frame at the start of `frame` (`frame[0] == 0xF0`).
fn parse_meta(frame: &[u8], batch: &mut DecodedBatch) -> Meta {
    let kind = frame[1];
    match kind {
        META_ERROR | META_INFO => {
            let Some(len) = frame[2..].windows(2).position(|w| w == TERMINATOR) else {
                return Meta::Incomplete;
            };
            let text = String::from_utf8_lossy(&frame[2..2 + len]).trim().to_string();
            if kind == META_ERROR {
                warn!("device error: {}", text);
                batch.errors.push(text.clone());
            } else {
                info!("device info: {}", text);
            }
            batch.raw_lines.push(text);
            Meta::Consumed(2 + len + TERMINATOR.len())
        }
        META_TIMESTAMP => {
            let Some(body) = complete_frame(frame, TIMESTAMP_FRAME_LEN) else {
                return terminated_or_skip(frame, TIMESTAMP_FRAME_LEN);
            };
            let raw_ms = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            batch.timestamps.push(Timestamp {
                time_ms: raw_ms & 0x7FFF_FFFF,
                buffer_pct: body[4],
            });
            Meta::Consumed(TIMESTAMP_FRAME_LEN)
        }
        META_END | META_OVERCURRENT | META_POWER_DOWN => {
            if complete_frame(frame, FLAG_FRAME_LEN).is_none() {
                return terminated_or_skip(frame, FLAG_FRAME_LEN);
            }
            match kind {
                META_END => {
                    batch.end_of_acquisition = true;
                    return Meta::End(FLAG_FRAME_LEN);
                }
                META_OVERCURRENT => batch.overcurrent = true,
                _ => info!("target power down"),
            }
            Meta::Consumed(FLAG_FRAME_LEN)
        }
        META_VOLTAGE => {
            let Some(body) = complete_frame(frame, VOLTAGE_FRAME_LEN) else {
                return terminated_or_skip(frame, VOLTAGE_FRAME_LEN);
            };
            let millivolts = u16::from_be_bytes([body[0], body[1]]);
            debug!("target voltage: {} mV", millivolts);
            Meta::Consumed(VOLTAGE_FRAME_LEN)
        }
        other => {
            // Only the header is skipped; a body, if any, is decoded as data.
            warn!("unknown metadata type {:#04X}, skipping header", other);
            Meta::Consumed(2)
        }
    }
}

/// Body of a fixed-length frame, or `None` if it is short or badly terminated.
fn complete_frame(frame: &[u8], len: usize) -> Option<&[u8]> {
    if frame.len() < len || frame[len - 2..len] != TERMINATOR {
        return None;
    }
    Some(&frame[2..len - 2])
}

/// A fixed-length frame that is not complete: wait if short, else resync.
fn terminated_or_skip(frame: &[u8], len: usize) -> Meta {
    if frame.len() < len {
        return Meta::Incomplete;
    }
    warn!(
        "metadata frame {:#04X} not terminated by FF FF, skipping header",
        frame[1]
    );
    Meta::Consumed(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TIMESTAMP: [u8; 9] = [0xF0, 0xF3, 0x00, 0x00, 0x0A, 0xBC, 50, 0xFF, 0xFF];

    #[test]
    fn unscaled_sample() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0x00, 0x05]);
        assert_eq!(batch.samples, vec![5.0]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn scaled_samples() {
        assert_eq!(decode_sample(0x1A, 0xBC), 2748.0 / 16.0);
        assert_eq!(decode_sample(0x30, 0x01), 1.0 / 4096.0);
        assert_eq!(decode_sample(0xE0, 0x10), 16.0 / 16f64.powi(14));
    }

    #[test]
    fn timestamp_frame() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&TIMESTAMP);
        assert_eq!(
            batch.timestamps,
            vec![Timestamp {
                time_ms: 2748,
                buffer_pct: 50
            }]
        );
        assert!(batch.samples.is_empty());
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn timestamp_overflow_bit_is_masked() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0xF0, 0xF3, 0x80, 0x00, 0x00, 0x01, 7, 0xFF, 0xFF]);
        assert_eq!(batch.timestamps[0].time_ms, 1);
        assert_eq!(batch.timestamps[0].buffer_pct, 7);
    }

    #[test]
    fn sample_split_at_every_boundary_matches_whole() {
        let stream = [0x12, 0x34, 0x00, 0x05, 0x2F, 0xFF, 0x71, 0x00];
        let whole = BinaryDecoder::new().feed(&stream).samples;
        assert_eq!(whole.len(), 4);

        for split in 0..=stream.len() {
            let mut dec = BinaryDecoder::new();
            let mut samples = dec.feed(&stream[..split]).samples;
            samples.extend(dec.feed(&stream[split..]).samples);
            assert_eq!(samples, whole, "split at {split}");
            assert_eq!(dec.pending_len(), 0);
        }
    }

    #[test]
    fn frame_truncated_before_terminator_yields_one_event() {
        for cut in 1..TIMESTAMP.len() {
            let mut dec = BinaryDecoder::new();
            let first = dec.feed(&TIMESTAMP[..cut]);
            assert!(first.timestamps.is_empty(), "cut at {cut}");
            assert!(first.samples.is_empty(), "cut at {cut}");
            assert_eq!(dec.pending_len(), cut);

            let second = dec.feed(&TIMESTAMP[cut..]);
            assert_eq!(second.timestamps.len(), 1, "cut at {cut}");
            assert!(second.samples.is_empty(), "cut at {cut}");
            assert_eq!(dec.pending_len(), 0);
        }
    }

    #[test]
    fn error_and_info_messages() {
        let mut dec = BinaryDecoder::new();
        let mut stream = vec![0xF0, 0xF1];
        stream.extend_from_slice(b" acq overrun ");
        stream.extend_from_slice(&[0xFF, 0xFF, 0xF0, 0xF2]);
        stream.extend_from_slice(b"hello");
        stream.extend_from_slice(&[0xFF, 0xFF, 0x00, 0x01]);

        let batch = dec.feed(&stream);
        assert_eq!(batch.errors, vec!["acq overrun".to_string()]);
        assert_eq!(
            batch.raw_lines,
            vec!["acq overrun".to_string(), "hello".to_string()]
        );
        assert_eq!(batch.samples, vec![1.0]);
    }

    #[test]
    fn variable_frame_waits_for_terminator() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0xF0, 0xF1, b'o', b'o', b'p', 0xFF]);
        assert!(batch.errors.is_empty());
        assert_eq!(dec.pending_len(), 6);

        let batch = dec.feed(&[0xFF]);
        assert_eq!(batch.errors, vec!["oop".to_string()]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn flag_frames() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[
            0xF0, 0xF5, 0xFF, 0xFF, // overcurrent
            0xF0, 0xF6, 0xFF, 0xFF, // power down
            0xF0, 0xF7, 0x0C, 0xE4, 0xFF, 0xFF, // 3300 mV
            0x00, 0x02,
        ]);
        assert!(batch.overcurrent);
        assert!(!batch.end_of_acquisition);
        assert_eq!(batch.samples, vec![2.0]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn end_frame_stops_decoding_and_keeps_the_rest() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0x00, 0x03, 0xF0, 0xF4, 0xFF, 0xFF, b'a', b'c', b'k']);
        assert!(batch.end_of_acquisition);
        assert_eq!(batch.samples, vec![3.0]);
        assert_eq!(dec.take_pending(), b"ack".to_vec());
    }

    #[test]
    fn unknown_type_skips_only_the_header() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0xF0, 0xF9, 0x01, 0x02]);
        assert_eq!(batch.samples, vec![258.0]);
        assert!(batch.errors.is_empty());
    }

    #[test]
    fn badly_terminated_frame_resyncs() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0xF0, 0xF4, 0x00, 0x00]);
        assert!(!batch.end_of_acquisition);
        assert_eq!(batch.samples, vec![0.0]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn stray_reserved_byte_is_skipped_one_at_a_time() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0xF0, 0x12, 0x34]);
        assert_eq!(batch.samples, vec![0x234 as f64 / 16.0]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn trailing_single_byte_is_carried_over() {
        let mut dec = BinaryDecoder::new();
        let batch = dec.feed(&[0x00, 0x01, 0x00]);
        assert_eq!(batch.samples, vec![1.0]);
        assert_eq!(dec.pending_len(), 1);

        dec.reset();
        assert_eq!(dec.pending_len(), 0);
        assert!(dec.feed(&[0x07]).samples.is_empty());
    }
}
