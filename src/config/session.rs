// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Scan session configuration

use serde::{Deserialize, Serialize};

/// Settings of a viewer-side scan session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between two demo sweep steps, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Number of operator messages retained by a session.
    #[serde(default = "default_message_log_len")]
    pub message_log_len: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_message_log_len() -> usize {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            message_log_len: default_message_log_len(),
        }
    }
}
