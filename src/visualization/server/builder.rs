// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::sync::Arc;

use rocket::figment::Figment;
use rocket::{routes, Build, Rocket};

use super::cors::{options, CORS};
use super::handlers::health;
use crate::acquisition::{PortResolver, TelemetryBroadcaster};
use crate::archive::ArchiveIndex;
use crate::visualization::api::{archive, command, status};
use crate::visualization::streaming::telemetry_socket;

/// What the reconnect endpoint needs to open the controller port again.
pub struct LinkControl {
    pub resolver: PortResolver,
    /// Port configured explicitly, bypassing resolution.
    pub forced_port: Option<String>,
}

/// State shared by the route handlers.
pub struct ServerState {
    pub broadcaster: Arc<TelemetryBroadcaster>,
    pub archive: ArchiveIndex,
    pub link_control: LinkControl,
}

/// Build the Rocket instance serving the gantry.
///
/// ### Parameters
/// * `figment` - Rocket configuration (address, port, TLS...)
/// * `state` - Device link broadcaster, archive index and reconnect settings
///
/// ### Returns
/// The Rocket instance, ready to be ignited
pub async fn build_rocket(figment: Figment, state: ServerState) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(CORS)
        .mount("/", routes![options, health, telemetry_socket])
        .mount(
            "/api",
            routes![
                status::get_status,
                archive::list_archives,
                archive::read_archive,
                command::post_command,
                command::reconnect_link,
            ],
        )
        .manage(state.broadcaster)
        .manage(state.archive)
        .manage(state.link_control)
}
