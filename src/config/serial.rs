// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serial link configuration
//!
//! Settings used to discover the gantry controller among the serial ports
//! of the host and to open the connection to it.

use serde::{Deserialize, Serialize};

/// Signatures matched, in order, against the description of each serial port.
///
/// They cover genuine Arduino boards (`Arduino`, vendor `2341`) and the usual
/// USB-UART bridges found on clones.
pub const DEFAULT_SIGNATURES: [&str; 6] = ["Arduino", "CH340", "CP210", "FT232", "2341", "wch.cn"];

/// Configuration of the serial link to the gantry controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Explicit device path (e.g. `/dev/ttyACM0` or `COM3`).
    ///
    /// When set, port discovery is skipped and this path is opened directly.
    #[serde(default)]
    pub port: Option<String>,

    /// Baud rate of the controller firmware. Default is 9600.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Ordered list of signatures used by port discovery.
    #[serde(default = "default_signatures")]
    pub signatures: Vec<String>,

    /// Open the link when the daemon starts.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,

    /// Also forward classified lines as raw lines, for firmware debugging.
    #[serde(default)]
    pub echo_raw_lines: bool,

    /// Longest line accepted before the pending bytes are dropped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_signatures() -> Vec<String> {
    DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect()
}

fn default_auto_connect() -> bool {
    true
}

fn default_max_line_bytes() -> usize {
    4096
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            signatures: default_signatures(),
            auto_connect: default_auto_connect(),
            echo_raw_lines: false,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}
