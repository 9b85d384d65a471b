// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Real-time telemetry channel
//!
//! Each WebSocket client on `/ws` is registered as a viewer of the
//! [`TelemetryBroadcaster`](crate::acquisition::TelemetryBroadcaster): it
//! receives every event as a JSON text frame and may send commands back.

pub mod telemetry;

pub use telemetry::{parse_inbound, telemetry_socket, InboundMessage};
