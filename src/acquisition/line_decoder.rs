// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Line framing and classification of the controller output
//!
//! The controller prints one message per line. Structured messages are JSON
//! objects, everything else is free text. Decoding happens in two steps:
//! [`LineSplitter`] turns arbitrary byte chunks into complete lines and
//! [`LineClassifier`] turns each line into [`LinkEvent`]s.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};

use super::{ControllerStatus, LinkEvent, StatusEvent, TelemetrySample};
use crate::config::GridConfig;

/// Reassembles newline-delimited lines from a byte stream.
///
/// Only complete lines are returned; bytes after the last `\n` stay buffered
/// until the next chunk. A trailing `\r` is removed.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Feed a chunk of bytes and collect the lines it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                // Tail of an oversized line
                self.discarding = false;
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            if self.buffer.len() > self.max_line_bytes {
                warn!(
                    "Dropping oversized line ({} bytes, limit {})",
                    self.buffer.len(),
                    self.max_line_bytes
                );
                self.buffer.clear();
                continue;
            }

            let mut line = std::mem::take(&mut self.buffer);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > self.max_line_bytes {
                warn!(
                    "No line delimiter within {} bytes, discarding pending data",
                    self.max_line_bytes
                );
                self.buffer.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Turns decoded lines into link events.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    grid: GridConfig,
    echo_raw_lines: bool,
}

impl LineClassifier {
    pub fn new(grid: GridConfig, echo_raw_lines: bool) -> Self {
        Self {
            grid,
            echo_raw_lines,
        }
    }

    /// Classify one line received at `received_at`.
    ///
    /// A JSON object with numeric `x`, `y` and `z` yields a sample, one with a
    /// string `status` yields a status event; a line with both yields the
    /// sample first. Anything else that is not blank, malformed JSON included,
    /// yields a raw line. Blank lines yield nothing.
    pub fn classify(&self, line: &str, received_at: DateTime<Utc>) -> Vec<LinkEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if trimmed.starts_with('{') {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => {
                    if let Some(sample) = sample_from_object(&map, &self.grid, received_at) {
                        events.push(LinkEvent::Sample {
                            sample,
                            received_at,
                        });
                    }
                    if let Some(Value::String(status)) = map.get("status") {
                        let message = map
                            .get("message")
                            .and_then(Value::as_str)
                            .filter(|m| !m.is_empty())
                            .map(str::to_string);
                        events.push(LinkEvent::Status(StatusEvent {
                            status: ControllerStatus::parse(status),
                            message,
                            timestamp: received_at,
                        }));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("Malformed JSON line from controller: {}", err);
                }
            }
        }

        if events.is_empty() || self.echo_raw_lines {
            events.push(LinkEvent::Raw {
                line: trimmed.to_string(),
                received_at,
            });
        }

        events
    }
}

/// Build a sample from a JSON object carrying numeric `x`, `y` and `z`.
///
/// Missing grid indices are derived from the grid step and a missing
/// timestamp falls back to `received_at`. Negative heights are clamped to 0.
pub fn sample_from_object(
    map: &Map<String, Value>,
    grid: &GridConfig,
    received_at: DateTime<Utc>,
) -> Option<TelemetrySample> {
    let x = map.get("x").and_then(Value::as_f64)?;
    let y = map.get("y").and_then(Value::as_f64)?;
    let z = map.get("z").and_then(Value::as_f64)?;
    if !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return None;
    }

    let grid_x = grid_index(map, "gridX", x, grid);
    let grid_y = grid_index(map, "gridY", y, grid);
    let timestamp = map
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| received_at.timestamp_millis());

    Some(TelemetrySample {
        x,
        y,
        z: z.max(0.0),
        grid_x,
        grid_y,
        timestamp,
    })
}

fn grid_index(map: &Map<String, Value>, key: &str, world: f64, grid: &GridConfig) -> i64 {
    match map.get(key) {
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|v| v.round() as i64))
            .unwrap_or_else(|| grid.to_grid(world)),
        None => grid.to_grid(world),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> LineClassifier {
        LineClassifier::new(GridConfig::default(), false)
    }

    #[test]
    fn test_splitter_keeps_partial_line_buffered() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.push(b"{\"x\":1,").is_empty());
        assert_eq!(splitter.pending(), 7);

        let lines = splitter.push(b"\"y\":2}\r\nhello\nwor");
        assert_eq!(lines, vec!["{\"x\":1,\"y\":2}".to_string(), "hello".to_string()]);
        assert_eq!(splitter.pending(), 3);
    }

    #[test]
    fn test_splitter_emits_empty_lines_between_delimiters() {
        let mut splitter = LineSplitter::new(1024);
        let lines = splitter.push(b"a\n\nb\n");
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn test_splitter_drops_oversized_line() {
        let mut splitter = LineSplitter::new(8);
        assert!(splitter.push(b"0123456789").is_empty());
        assert_eq!(splitter.pending(), 0);
        // The rest of the oversized line is dropped too
        let lines = splitter.push(b"abc\nok\n");
        assert_eq!(lines, vec!["ok"]);
    }

    #[test]
    fn test_classify_sample_derives_grid_and_clamps_height() {
        let now = Utc::now();
        let events = classifier().classify("{\"x\":10,\"y\":15,\"z\":-2.5}", now);
        assert_eq!(events.len(), 1);
        match &events[0] {
            LinkEvent::Sample { sample, .. } => {
                assert_eq!(sample.grid_x, 2);
                assert_eq!(sample.grid_y, 3);
                assert_eq!(sample.z, 0.0);
                assert_eq!(sample.timestamp, now.timestamp_millis());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_classify_sample_keeps_reported_grid() {
        let events = classifier().classify(
            "{\"x\":0,\"y\":0,\"z\":4,\"gridX\":7,\"gridY\":9,\"timestamp\":1234}",
            Utc::now(),
        );
        match &events[0] {
            LinkEvent::Sample { sample, .. } => {
                assert_eq!((sample.grid_x, sample.grid_y), (7, 9));
                assert_eq!(sample.timestamp, 1234);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_classify_missing_coordinate_is_raw() {
        let events = classifier().classify("{\"x\":1,\"y\":2}", Utc::now());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LinkEvent::Raw { .. }));
    }

    #[test]
    fn test_classify_non_numeric_coordinate_is_raw() {
        let events = classifier().classify("{\"x\":\"1\",\"y\":2,\"z\":3}", Utc::now());
        assert!(matches!(events.as_slice(), [LinkEvent::Raw { .. }]));
    }

    #[test]
    fn test_classify_malformed_json_is_raw() {
        let events = classifier().classify("{\"x\":1,\"y\":", Utc::now());
        match events.as_slice() {
            [LinkEvent::Raw { line, .. }] => assert_eq!(line, "{\"x\":1,\"y\":"),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_classify_status_with_message() {
        let events =
            classifier().classify("{\"status\":\"paused\",\"message\":\"by operator\"}", Utc::now());
        match events.as_slice() {
            [LinkEvent::Status(status)] => {
                assert_eq!(status.status, ControllerStatus::Paused);
                assert_eq!(status.message.as_deref(), Some("by operator"));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_classify_sample_and_status_in_one_line() {
        let events =
            classifier().classify("{\"x\":5,\"y\":5,\"z\":1,\"status\":\"scanning\"}", Utc::now());
        assert!(matches!(
            events.as_slice(),
            [LinkEvent::Sample { .. }, LinkEvent::Status(_)]
        ));
    }

    #[test]
    fn test_classify_blank_and_text_lines() {
        assert!(classifier().classify("   ", Utc::now()).is_empty());
        let events = classifier().classify("Gantry firmware v1.2", Utc::now());
        assert!(matches!(events.as_slice(), [LinkEvent::Raw { .. }]));
    }

    #[test]
    fn test_echo_raw_lines() {
        let classifier = LineClassifier::new(GridConfig::default(), true);
        let events = classifier.classify("{\"status\":\"ready\"}", Utc::now());
        assert!(matches!(
            events.as_slice(),
            [LinkEvent::Status(_), LinkEvent::Raw { .. }]
        ));
    }
}
