// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{get, State};
use serde::{Deserialize, Serialize};

use crate::acquisition::stream::BroadcastStats;
use crate::acquisition::{LinkState, TelemetryBroadcaster};

/// Link and broadcast status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub port: Option<String>,
    pub state: LinkState,
    /// Number of connected viewers
    pub viewers: usize,
    pub broadcast: BroadcastStats,
    pub timestamp: DateTime<Utc>,
}

#[get("/status")]
pub fn get_status(broadcaster: &State<Arc<TelemetryBroadcaster>>) -> Json<StatusResponse> {
    let link = broadcaster.link().status();
    Json(StatusResponse {
        connected: link.is_open(),
        port: link.port,
        state: link.state,
        viewers: broadcaster.viewer_count(),
        broadcast: broadcaster.stats(),
        timestamp: Utc::now(),
    })
}
