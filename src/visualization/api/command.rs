// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Command relay endpoints

use std::sync::Arc;

use log::{info, warn};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{post, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acquisition::{LinkError, LinkStatus, TelemetryBroadcaster};
use crate::visualization::server::LinkControl;

/// Command sent by a client, optionally parameterized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl CommandRequest {
    /// The line sent to the controller: `COMMAND` or `COMMAND:value`.
    pub fn to_line(&self) -> String {
        format_command(&self.command, self.value.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconnectResponse {
    pub success: bool,
    pub message: String,
    pub link: LinkStatus,
}

/// Append a parameter to a command token.
///
/// Strings are appended as is, other JSON values in their JSON form. A null
/// value leaves the token alone.
pub fn format_command(command: &str, value: Option<&Value>) -> String {
    let command = command.trim();
    match value {
        None | Some(Value::Null) => command.to_string(),
        Some(Value::String(text)) => format!("{}:{}", command, text),
        Some(other) => format!("{}:{}", command, other),
    }
}

/// Relay a command to the controller
#[post("/command", format = "json", data = "<request>")]
pub fn post_command(
    request: Json<CommandRequest>,
    broadcaster: &State<Arc<TelemetryBroadcaster>>,
) -> (Status, Json<CommandResponse>) {
    let line = request.to_line();
    match broadcaster.relay_command(&line) {
        Ok(()) => (
            Status::Ok,
            Json(CommandResponse {
                success: true,
                message: format!("Command sent: {}", line),
            }),
        ),
        Err(err) => {
            let status = match err {
                LinkError::NotConnected => Status::Conflict,
                LinkError::InvalidCommand(_) => Status::BadRequest,
                _ => Status::ServiceUnavailable,
            };
            (
                status,
                Json(CommandResponse {
                    success: false,
                    message: err.to_string(),
                }),
            )
        }
    }
}

/// Close the controller link and open it again
#[post("/link/reconnect")]
pub async fn reconnect_link(
    broadcaster: &State<Arc<TelemetryBroadcaster>>,
    control: &State<LinkControl>,
) -> (Status, Json<ReconnectResponse>) {
    let link = broadcaster.link();
    match link
        .reconnect(&control.resolver, control.forced_port.as_deref())
        .await
    {
        Ok(port) => {
            info!("Controller reconnected on {}", port);
            (
                Status::Ok,
                Json(ReconnectResponse {
                    success: true,
                    message: format!("Connected to {}", port),
                    link: link.status(),
                }),
            )
        }
        Err(err) => {
            warn!("Reconnect failed: {}", err);
            (
                Status::ServiceUnavailable,
                Json(ReconnectResponse {
                    success: false,
                    message: err.to_string(),
                    link: link.status(),
                }),
            )
        }
    }
}
