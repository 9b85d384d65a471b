// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Gantry controller acquisition
//!
//! This module owns everything between the serial port and the viewers:
//!
//! - [`port_resolver`]: finds the controller among the host serial ports
//! - [`line_decoder`]: splits the byte stream into lines and classifies them
//! - [`device_link`]: connection lifecycle, event stream and command writes
//! - [`stream`]: fan-out of link events to every connected viewer
//!
//! The types shared by these layers (samples, status and connection events)
//! are defined here.

pub mod device_link;
pub mod line_decoder;
pub mod port_resolver;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use device_link::{DeviceLink, LinkError, LinkState, LinkStatus};
pub use line_decoder::{LineClassifier, LineSplitter};
pub use port_resolver::{PortCandidate, PortEnumerator, PortResolver, SystemPorts};
pub use stream::{Envelope, TelemetryBroadcaster, TelemetryEvent, Viewer};

/// A single height measurement reported by the gantry.
///
/// `x` and `y` are real-world coordinates, `grid_x` and `grid_y` the matching
/// cell of the scan grid. `z` is never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub grid_x: i64,
    pub grid_y: i64,
    /// Milliseconds, as reported by the source of the sample.
    pub timestamp: i64,
}

/// Status reported by the controller firmware.
///
/// Unknown values are kept verbatim in [`ControllerStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControllerStatus {
    Connected,
    Disconnected,
    Ready,
    Scanning,
    Paused,
    Complete,
    Error,
    Other(String),
}

impl ControllerStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "ready" => Self::Ready,
            "scanning" => Self::Scanning,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Scanning => "scanning",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for ControllerStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ControllerStatus> for String {
    fn from(value: ControllerStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status line decoded from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub status: ControllerStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the link connectivity, emitted on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Events produced by the device link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link opened, closed or failed.
    Connection(ConnectionStatus),
    /// A line carrying a complete `x`, `y`, `z` triple.
    Sample {
        sample: TelemetrySample,
        received_at: DateTime<Utc>,
    },
    /// A line carrying a controller status.
    Status(StatusEvent),
    /// Any other non-empty line.
    Raw {
        line: String,
        received_at: DateTime<Utc>,
    },
}
