//! ASCII-decimal stream decoder (`format ascii_dec`).
//!
//! Each measurement is seven printable characters plus `\r\n`:
//!
//! ```text
//! 6409-07\r\n  ->  6409 x 10^-7 A = 640.9 uA
//! ```
//!
//! Measurement lines start with a digit. Everything else the device injects
//! (`ack`, `err`, `end`, `error ...`, `Timestamp ...`, summary markers) is a
//! metadata line and is classified by [`classify`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::batch::{AckLine, DecodedBatch, Timestamp};

static SECONDS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*s\b").unwrap());
static MILLIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*ms").unwrap());
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*%").unwrap());

/// Minimum length of a measurement line: `DDDD` `S` `ZZ`.
const SAMPLE_LEN: usize = 7;

/// Classification of one complete text line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// Measurement sample; `None` when the line is malformed and must be dropped.
    Sample(Option<f64>),
    Ack { command: String, payload: String },
    Err { command: String },
    End,
    Error(String),
    Timestamp(Timestamp),
    /// Summary/power markers and anything else: logged only.
    Unclassified,
}

/// Classify a line (without its terminator). First match wins.
pub fn classify(line: &str) -> Line {
    let Some(first) = line.chars().next() else {
        return Line::Unclassified;
    };

    if first.is_ascii_digit() {
        Line::Sample(parse_sample(line))
    } else if let Some(rest) = line.strip_prefix("ack ") {
        let (command, payload) = split_command(rest);
        Line::Ack { command, payload }
    } else if let Some(rest) = line.strip_prefix("err ") {
        Line::Err {
            command: rest.trim().to_string(),
        }
    } else if line == "end" {
        Line::End
    } else if let Some(rest) = line.strip_prefix("error") {
        Line::Error(rest.trim().to_string())
    } else if line.to_ascii_lowercase().contains("timestamp") {
        Line::Timestamp(parse_timestamp(line))
    } else {
        Line::Unclassified
    }
}

/// Parse `DDDDSZZ` into `mantissa * 10^(sign * exponent)`.
pub fn parse_sample(line: &str) -> Option<f64> {
    if line.len() < SAMPLE_LEN {
        return None;
    }
    let mantissa: u32 = line.get(0..4)?.parse().ok()?;
    let sign = if line.get(4..5)? == "-" { -1 } else { 1 };
    let exponent: i32 = line.get(5..7)?.parse().ok()?;
    Some(f64::from(mantissa) * 10f64.powf(f64::from(sign * exponent)))
}

/// Extract `(elapsed ms, buffer %)` from a timestamp line.
///
/// The scan is unanchored: `<n>s` contributes seconds, `<n>ms` milliseconds,
/// `<n>%` the buffer level. Missing parts count as zero.
pub fn parse_timestamp(line: &str) -> Timestamp {
    let number = |re: &Regex| -> Option<u64> {
        re.captures(line)
            .map(|c| c[1].parse::<u64>().unwrap_or(u64::MAX))
    };

    let seconds = number(&SECONDS_RE).unwrap_or(0);
    let millis = number(&MILLIS_RE).unwrap_or(0);
    let time_ms = seconds.saturating_mul(1000).saturating_add(millis);
    let buffer_pct = number(&PERCENT_RE).unwrap_or(0);

    Timestamp {
        time_ms: u32::try_from(time_ms).unwrap_or(u32::MAX),
        buffer_pct: u8::try_from(buffer_pct).unwrap_or(u8::MAX),
    }
}

/// Split `"<cmd> [payload]"` on the first run of whitespace.
pub(crate) fn split_command(rest: &str) -> (String, String) {
    let rest = rest.trim();
    match rest.split_once(char::is_whitespace) {
        Some((cmd, payload)) => (cmd.to_string(), payload.trim_start().to_string()),
        None => (rest.to_string(), String::new()),
    }
}

/// Incremental decoder for the ASCII-decimal stream.
///
/// Bytes that do not yet form a complete line stay in the carry-over until the
/// next [`feed`](Self::feed) or an explicit [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct AsciiDecoder {
    buf: Vec<u8>,
}

impl AsciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial line. Call on every new acquisition session.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently held back waiting for a line terminator.
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

        let mut cursor = 0;
        while let Some(offset) = self.buf[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            let text = String::from_utf8_lossy(&self.buf[cursor..end]);
            cursor = end + 1;

            let line = text.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            batch.raw_lines.push(line.to_string());
            apply(classify(line), &mut batch);
        }

        self.buf.drain(..cursor);
        batch
    }
}

fn apply(line: Line, batch: &mut DecodedBatch) {
    match line {
        Line::Sample(Some(value)) => batch.samples.push(value),
        Line::Sample(None) => {}
        Line::Ack { command, payload } => batch.acks.push(AckLine::ack(command, payload)),
        Line::Err { command } => batch.acks.push(AckLine::err(command, "")),
        Line::End => batch.end_of_acquisition = true,
        Line::Error(message) => batch.errors.push(message),
        Line::Timestamp(ts) => batch.timestamps.push(ts),
        Line::Unclassified => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= b.abs() * 1e-12
    }

    #[test]
    fn decodes_documented_sample() {
        let mut dec = AsciiDecoder::new();
        let batch = dec.feed(b"6409-07\r\n");
        assert_eq!(batch.samples.len(), 1);
        assert!(close(batch.samples[0], 6.409e-4));
        assert_eq!(batch.raw_lines, vec!["6409-07".to_string()]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn sample_sign_and_exponent_rule() {
        let cases = [
            ("6409-07", 6409.0 * 1e-7),
            ("1234+02", 1234.0 * 1e2),
            ("0001-00", 1.0),
            ("9999x03", 9999.0 * 1e3),
            ("0500-12", 500.0 * 1e-12),
        ];
        for (text, expected) in cases {
            let got = parse_sample(text).unwrap();
            assert!(close(got, expected), "{text}: {got} != {expected}");
        }
    }

    #[test]
    fn large_exponents_are_exact() {
        assert_eq!(parse_sample("0001-23"), Some(1e-23));
        assert_eq!(parse_sample("0001+22"), Some(1e22));
    }

    #[test]
    fn malformed_samples_are_dropped_silently() {
        let mut dec = AsciiDecoder::new();
        let batch = dec.feed(b"640-07\r\n12ab-07\r\n1234-x7\r\n1000-03\r\n");
        assert_eq!(batch.samples.len(), 1);
        assert!(close(batch.samples[0], 1.0));
        assert!(batch.errors.is_empty());
        assert_eq!(batch.raw_lines.len(), 4);
    }

    #[test]
    fn line_split_across_feeds_is_reassembled() {
        let mut dec = AsciiDecoder::new();
        let first = dec.feed(b"1000-0");
        assert!(first.samples.is_empty());
        assert_eq!(dec.pending_len(), 6);

        let second = dec.feed(b"3\r\n2000-03\r");
        assert_eq!(second.samples.len(), 1);
        assert!(close(second.samples[0], 1.0));
        assert_eq!(dec.pending_len(), 8);

        let third = dec.feed(b"\n");
        assert!(close(third.samples[0], 2.0));
    }

    #[test]
    fn classifies_ack_and_err_lines() {
        assert_eq!(
            classify("ack version 1.0.5"),
            Line::Ack {
                command: "version".into(),
                payload: "1.0.5".into()
            }
        );
        assert_eq!(
            classify("ack stop"),
            Line::Ack {
                command: "stop".into(),
                payload: String::new()
            }
        );
        assert_eq!(
            classify("err  freq"),
            Line::Err {
                command: "freq".into()
            }
        );
    }

    #[test]
    fn ack_lines_reach_the_batch() {
        let mut dec = AsciiDecoder::new();
        let batch = dec.feed(b"ack stop\r\nerr start\r\n");
        assert_eq!(
            batch.acks,
            vec![AckLine::ack("stop", ""), AckLine::err("start", "")]
        );
    }

    #[test]
    fn end_and_error_lines() {
        let mut dec = AsciiDecoder::new();
        let batch = dec.feed(b"error  buffer overflow \r\nend\r\n");
        assert!(batch.end_of_acquisition);
        assert_eq!(batch.errors, vec!["buffer overflow".to_string()]);
        assert!(batch.has_data());
    }

    #[test]
    fn ending_is_exact_match_only() {
        assert_eq!(classify("end"), Line::End);
        assert_eq!(classify("endx"), Line::Unclassified);
    }

    #[test]
    fn timestamp_lines() {
        assert_eq!(
            parse_timestamp("Timestamp: 12s 345ms buff 40%"),
            Timestamp {
                time_ms: 12_345,
                buffer_pct: 40
            }
        );
        assert_eq!(
            parse_timestamp("timestamp 250ms"),
            Timestamp {
                time_ms: 250,
                buffer_pct: 0
            }
        );
        assert_eq!(
            classify("TIMESTAMP 3s"),
            Line::Timestamp(Timestamp {
                time_ms: 3000,
                buffer_pct: 0
            })
        );
    }

    #[test]
    fn unclassified_lines_are_only_logged() {
        let mut dec = AsciiDecoder::new();
        let batch = dec.feed(b"summary beg\r\npwr on\r\n\r\n\n");
        assert!(!batch.has_data());
        assert!(batch.acks.is_empty());
        assert_eq!(
            batch.raw_lines,
            vec!["summary beg".to_string(), "pwr on".to_string()]
        );
    }

    #[test]
    fn reset_discards_partial_line() {
        let mut dec = AsciiDecoder::new();
        dec.feed(b"12");
        dec.reset();
        let batch = dec.feed(b"34-03\r\n");
        // "34-03" is too short to be a sample, so nothing stitched through.
        assert!(batch.samples.is_empty());
        assert_eq!(batch.raw_lines, vec!["34-03".to_string()]);
    }

    #[test]
    fn take_pending_drains_carry_over() {
        let mut dec = AsciiDecoder::new();
        dec.feed(b"end\r\nack st");
        assert_eq!(dec.take_pending(), b"ack st".to_vec());
        assert_eq!(dec.pending_len(), 0);
    }
}
