// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use anyhow::{Context, Result};
use base64::Engine;
use log::{debug, warn};

use super::Config;

/// Output the embedded JSON schema to the console.
///
/// Called when the `--show-config-schema` flag is provided on the command
/// line.
///
/// # Example
///
/// ```bash
/// ./gantry_control --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema_str = include_str!("../../resources/config.schema.json");

    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;

    println!("{}", formatted_schema);

    Ok(())
}

/// Check if a string is a valid IP address
///
/// Validates that a string represents a valid IPv4 or IPv6 address,
/// or is one of the special values like "localhost" or "0.0.0.0".
pub fn is_valid_ip_address(addr: &str) -> bool {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    matches!(addr, "localhost" | "::" | "::0" | "0.0.0.0")
}

/// Validates the configuration against additional rules that aren't covered by the JSON schema.
///
/// # Validation Rules
///
/// - **SSL Configuration**: a certificate requires a key and vice versa, both valid base64
/// - **Port Range**: the server port is within 1-65534
/// - **IP Address Format**: a non IP address only produces a warning
/// - **Grid**: the step size is strictly positive and finite
/// - **Serial**: at least one discovery signature unless a port is forced, no blank signature
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    if let Some(cert) = &config.server.cert {
        if config.server.key.is_none() {
            anyhow::bail!("SSL certificate provided without a key");
        }

        let _ = base64::engine::general_purpose::STANDARD
            .decode(cert)
            .context("SSL certificate is not valid base64")?;
    }

    if let Some(key) = &config.server.key {
        if config.server.cert.is_none() {
            anyhow::bail!("SSL key provided without a certificate");
        }

        let _ = base64::engine::general_purpose::STANDARD
            .decode(key)
            .context("SSL key is not valid base64")?;
    }

    if config.server.port < 1 || config.server.port > 65534 {
        anyhow::bail!("Invalid port number: {}", config.server.port);
    }

    if !is_valid_ip_address(&config.server.address) {
        warn!(
            "Potentially invalid address format: {}",
            config.server.address
        );
    }

    if !(config.grid.step_size.is_finite() && config.grid.step_size > 0.0) {
        anyhow::bail!("Invalid grid step size: {}", config.grid.step_size);
    }

    if config.serial.port.is_none() && config.serial.signatures.is_empty() {
        anyhow::bail!("No serial port configured and no discovery signature available");
    }

    if config
        .serial
        .signatures
        .iter()
        .any(|signature| signature.trim().is_empty())
    {
        anyhow::bail!("Serial discovery signatures must not be blank");
    }

    Ok(())
}
