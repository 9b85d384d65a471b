// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Web server configuration
//!
//! This module defines the settings of the Rocket server that exposes the
//! telemetry channel and the archive endpoints to viewers.

use serde::{Deserialize, Serialize};

/// Configuration for the telemetry web server.
///
/// Controls network binding, server identification and optional TLS.
/// Every field has a default, so the section can be omitted entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The port number for the web server. Default is 3001.
    #[serde(default = "default_port")]
    pub port: u16,

    /// The network address the server binds to.
    ///
    /// Can be an IPv4/IPv6 address or a hostname. Default is "127.0.0.1".
    #[serde(default = "default_address")]
    pub address: String,

    /// Server identifier sent in the `Server` header.
    #[serde(default = "default_name")]
    pub name: String,

    /// SSL certificate PEM data, Base64 encoded. Must be set together with `key`.
    #[serde(default)]
    pub cert: Option<String>,

    /// SSL key PEM data, Base64 encoded. Must be set together with `cert`.
    #[serde(default)]
    pub key: Option<String>,

    /// Whether the daemon starts the web server at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    3001
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_name() -> String {
    format!("GantryControl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            name: default_name(),
            cert: None,
            key: None,
            enabled: default_enabled(),
        }
    }
}
