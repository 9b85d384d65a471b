// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated scan source
//!
//! The demo sweep visits every grid cell in row-major order (X fastest) and
//! synthesizes a height for each one from a smooth wave surface plus noise.

use chrono::Utc;
use rand::{Rng, RngCore};

use crate::acquisition::TelemetrySample;
use crate::config::GridConfig;

/// Spatial frequency of the wave, per grid cell.
pub const WAVE_FREQUENCY: f64 = 0.1;
/// Peak amplitude of the wave.
pub const WAVE_AMPLITUDE: f64 = 10.0;
/// Height offset of the surface.
pub const BASELINE: f64 = 10.0;
/// Noise is drawn uniformly from `[0, NOISE_SPAN)`.
pub const NOISE_SPAN: f64 = 5.0;

/// Height of the demo surface at a grid cell, never negative.
pub fn surface_height(grid_x: i64, grid_y: i64, noise: f64) -> f64 {
    let wave = (grid_x as f64 * WAVE_FREQUENCY).sin()
        * (grid_y as f64 * WAVE_FREQUENCY).cos()
        * WAVE_AMPLITUDE;
    (wave + noise + BASELINE).max(0.0)
}

/// Synthesize the sample of a grid cell.
pub fn synthesize(grid: &GridConfig, grid_x: i64, grid_y: i64, rng: &mut dyn RngCore) -> TelemetrySample {
    let noise = rng.random_range(0.0..NOISE_SPAN);
    TelemetrySample {
        x: grid.to_world(grid_x),
        y: grid.to_world(grid_y),
        z: surface_height(grid_x, grid_y, noise),
        grid_x,
        grid_y,
        timestamp: Utc::now().timestamp_millis(),
    }
}

/// Row-major cursor over the grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCursor {
    index: u64,
    width: u64,
    cells: u64,
}

impl SweepCursor {
    pub fn new(grid: &GridConfig) -> Self {
        Self {
            index: 0,
            width: grid.width.max(1) as u64,
            cells: grid.cell_count(),
        }
    }

    /// Cell the next tick will visit, or `None` past the last cell.
    pub fn current(&self) -> Option<(i64, i64)> {
        if self.index >= self.cells {
            return None;
        }
        Some(((self.index % self.width) as i64, (self.index / self.width) as i64))
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1).min(self.cells);
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_surface_height_formula() {
        // sin(0) = 0, so only baseline and noise remain
        assert_eq!(surface_height(0, 0, 2.0), 12.0);
        let expected = (1.0f64).sin() * (0.5f64).cos() * 10.0 + 1.0 + 10.0;
        assert!((surface_height(10, 5, 1.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_surface_height_is_never_negative() {
        for x in 0..200 {
            for y in 0..200 {
                assert!(surface_height(x, y, 0.0) >= 0.0);
            }
        }
    }

    #[test]
    fn test_synthesize_maps_grid_to_world() {
        let grid = GridConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let sample = synthesize(&grid, 3, 4, &mut rng);
        assert_eq!((sample.x, sample.y), (15.0, 20.0));
        assert_eq!((sample.grid_x, sample.grid_y), (3, 4));
        let base = surface_height(3, 4, 0.0);
        assert!(sample.z >= base && sample.z < base + NOISE_SPAN);
    }

    #[test]
    fn test_cursor_is_row_major() {
        let grid = GridConfig {
            width: 3,
            height: 2,
            step_size: 1.0,
        };
        let mut cursor = SweepCursor::new(&grid);
        let mut cells = Vec::new();
        while let Some(cell) = cursor.current() {
            cells.push(cell);
            cursor.advance();
        }
        assert_eq!(cells, vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);
        cursor.advance();
        assert_eq!(cursor.current(), None);
        cursor.reset();
        assert_eq!(cursor.current(), Some((0, 0)));
    }
}
