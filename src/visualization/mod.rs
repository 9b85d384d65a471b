// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).
//!
//! Visualization module
//!
//! This module exposes the gantry to viewer clients: the Rocket web server,
//! its REST API and the telemetry WebSocket channel.

pub mod api;
pub mod server;
pub mod streaming;
