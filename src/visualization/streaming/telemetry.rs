// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::sync::Arc;

use log::{debug, warn};
use rocket::futures::{SinkExt, StreamExt};
use rocket::{get, State};
use rocket_ws as ws;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acquisition::stream::Viewer;
use crate::acquisition::TelemetryBroadcaster;
use crate::visualization::api::command::format_command;

/// Message a viewer may send on the telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    SendCommand {
        command: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

/// Turn an inbound text frame into a controller command line.
///
/// JSON frames must be `send-command` messages; any other text is taken as
/// a bare command. Returns `None` for blank or unusable frames.
pub fn parse_inbound(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if !text.starts_with('{') {
        return Some(text.to_string());
    }

    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::SendCommand { command, value }) => {
            let line = format_command(&command, value.as_ref());
            (!line.is_empty()).then_some(line)
        }
        Err(err) => {
            warn!("Ignoring malformed viewer message: {}", err);
            None
        }
    }
}

fn handle_inbound(viewer: &mut Viewer, text: &str) {
    if let Some(command) = parse_inbound(text) {
        // On failure the viewer is sent an error event
        if viewer.send_command(&command).is_ok() {
            debug!("Viewer {} sent {}", viewer.id(), command);
        }
    }
}

/// Telemetry WebSocket
#[get("/ws")]
pub fn telemetry_socket(
    ws: ws::WebSocket,
    broadcaster: &State<Arc<TelemetryBroadcaster>>,
) -> ws::Channel<'static> {
    let broadcaster = broadcaster.inner().clone();
    ws.channel(move |mut stream| {
        Box::pin(async move {
            let mut viewer = broadcaster.connect_viewer();
            loop {
                tokio::select! {
                    event = viewer.next_event() => match event {
                        Some(envelope) => match serde_json::to_string(&envelope) {
                            Ok(text) => stream.send(ws::Message::Text(text)).await?,
                            Err(err) => warn!("Failed to serialize telemetry event: {}", err),
                        },
                        None => break,
                    },
                    message = stream.next() => match message {
                        Some(Ok(ws::Message::Text(text))) => handle_inbound(&mut viewer, &text),
                        Some(Ok(ws::Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!("Viewer {} socket error: {}", viewer.id(), err);
                            break;
                        }
                    },
                }
            }
            Ok(())
        })
    })
}
