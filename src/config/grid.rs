// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Scan grid configuration

use serde::{Deserialize, Serialize};

/// Geometry of the scan grid.
///
/// A grid cell `(gx, gy)` sits at `(gx * step_size, gy * step_size)` in real
/// world units (centimeters for the stock gantry).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of cells along X.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Number of cells along Y.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Distance between two neighbouring cells.
    #[serde(default = "default_step_size")]
    pub step_size: f64,
}

fn default_width() -> u32 {
    20
}

fn default_height() -> u32 {
    15
}

fn default_step_size() -> f64 {
    5.0
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            step_size: default_step_size(),
        }
    }
}

impl GridConfig {
    /// Total number of cells, used as the scan progress denominator.
    pub fn cell_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Map a real-world coordinate to its grid index.
    pub fn to_grid(&self, value: f64) -> i64 {
        if self.step_size <= 0.0 || !value.is_finite() {
            return 0;
        }
        (value / self.step_size).round() as i64
    }

    /// Map a grid index to its real-world coordinate.
    pub fn to_world(&self, index: i64) -> f64 {
        index as f64 * self.step_size
    }

    /// Whether a grid cell lies inside the grid.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }
}
