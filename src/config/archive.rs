// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Scan archive configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Location of the archived scan files.
///
/// Archives are written by the data collector as newline-delimited JSON and
/// are only ever read by this application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding the `gantry_scan_*.json` files. Default is the
    /// current working directory.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
        }
    }
}
