// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Web server construction
//!
//! - [`builder`]: assembles the Rocket instance and its managed state
//! - [`cors`]: permissive CORS fairing and preflight handler
//! - [`handlers`]: liveness endpoint

pub mod builder;
pub mod cors;
pub mod handlers;

pub use builder::{build_rocket, LinkControl, ServerState};
pub use cors::CORS;
