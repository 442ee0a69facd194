//! Decoded telemetry shared by both stream decoders.

use serde::Serialize;

/// One ack/err response line: `(success, command, payload)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckLine {
    pub success: bool,
    /// Command the device is answering (may be empty for bare `err` lines).
    pub command: String,
    pub payload: String,
}

impl AckLine {
    pub fn ack(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            success: true,
            command: command.into(),
            payload: payload.into(),
        }
    }

    pub fn err(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            success: false,
            command: command.into(),
            payload: payload.into(),
        }
    }
}

/// Timestamp metadata record injected by the device into the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    /// Milliseconds elapsed since the acquisition started.
    pub time_ms: u32,
    /// Fill level of the device's transmit buffer, in percent.
    pub buffer_pct: u8,
}

/// Output of one decode call.
///
/// Samples are in amperes, or joules when the device output type is `energy`.
/// An empty batch is a normal result, not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedBatch {
    pub samples: Vec<f64>,
    pub acks: Vec<AckLine>,
    pub errors: Vec<String>,
    pub timestamps: Vec<Timestamp>,
    pub end_of_acquisition: bool,
    pub overcurrent: bool,
    /// Every decoded text line, for console/log use.
    pub raw_lines: Vec<String>,
}

impl DecodedBatch {
    /// Whether the batch carries anything a telemetry consumer cares about.
    ///
    /// Raw lines and acks are reported separately and do not count.
    pub fn has_data(&self) -> bool {
        !self.samples.is_empty()
            || !self.timestamps.is_empty()
            || !self.errors.is_empty()
            || self.end_of_acquisition
            || self.overcurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_has_no_data() {
        let batch = DecodedBatch::default();
        assert!(!batch.has_data());
    }

    #[test]
    fn acks_and_raw_lines_alone_are_not_data() {
        let batch = DecodedBatch {
            acks: vec![AckLine::ack("stop", "")],
            raw_lines: vec!["ack stop".into()],
            ..Default::default()
        };
        assert!(!batch.has_data());
    }

    #[test]
    fn flags_count_as_data() {
        let batch = DecodedBatch {
            overcurrent: true,
            ..Default::default()
        };
        assert!(batch.has_data());

        let batch = DecodedBatch {
            timestamps: vec![Timestamp {
                time_ms: 1,
                buffer_pct: 0,
            }],
            ..Default::default()
        };
        assert!(batch.has_data());
    }

    #[test]
    fn serializes_to_json() {
        let batch = DecodedBatch {
            samples: vec![0.5],
            end_of_acquisition: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["samples"][0], 0.5);
        assert_eq!(json["end_of_acquisition"], true);
    }
}
