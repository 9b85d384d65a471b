// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Gantry Control
//!
//! Control server of a 2-axis scanning gantry. It finds the controller on
//! the serial ports, decodes its line-oriented telemetry, fans it out to any
//! number of viewers over a WebSocket channel and relays their commands back.
//! Viewers keep a scan session that reconciles live data, a simulated demo
//! sweep and archived scans.
//!
//! ## Modules
//!
//! - [`acquisition`]: port resolution, device link and telemetry broadcast
//! - [`archive`]: listing and reading archived scans
//! - [`session`]: per-viewer scan state machine
//! - [`config`]: YAML configuration validated by a JSON schema
//! - [`daemon`]: background task management
//! - [`visualization`]: Rocket web server and API

pub mod acquisition;
pub mod archive;
pub mod config;
pub mod daemon;
pub mod session;
pub mod visualization;

pub use acquisition::{TelemetryEvent, TelemetrySample};
pub use config::Config;
