// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the gantry controller
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings. The configuration is backed by a YAML file and
//! validated against an embedded JSON schema.
//!
//! ## Configuration Structure
//!
//! - `server`: Settings for the telemetry web server
//! - `serial`: Discovery and connection settings of the controller link
//! - `grid`: Scan grid geometry
//! - `archive`: Location of archived scans
//! - `broadcast`: Telemetry fan-out buffering
//! - `session`: Viewer-side scan session settings
//!
//! ## Usage
//!
//! ```no_run
//! use gantry_control::config::Config;
//! use std::path::Path;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file(Path::new("config.yaml")).unwrap();
//!
//! // Apply command line overrides if needed
//! config.apply_args(
//!     Some(8081),                           // Web port
//!     Some("0.0.0.0".to_string()),          // Web address
//!     true,                                 // Server mode
//!     Some("/dev/ttyACM0".to_string()),     // Serial port
//!     None,                                 // Baud rate
//!     None,                                 // Archive directory
//! );
//!
//! println!("Server port: {}", config.server.port);
//! ```

pub mod archive;
pub mod broadcast;
pub mod grid;
pub mod serial;
pub mod server;
pub mod session;
pub mod utils;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use archive::ArchiveConfig;
pub use broadcast::BroadcastConfig;
pub use grid::GridConfig;
pub use serial::{SerialConfig, DEFAULT_SIGNATURES};
pub use server::ServerConfig;
pub use session::SessionConfig;
pub use utils::{is_valid_ip_address, output_config_schema};

/// Root configuration structure of the gantry controller.
///
/// Deserialized from and serialized to YAML. Each section falls back to its
/// default values when it is missing from the file, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings for the telemetry web server.
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings for the serial link to the controller.
    #[serde(default)]
    pub serial: SerialConfig,

    /// Scan grid geometry shared by the decoder and the sessions.
    #[serde(default)]
    pub grid: GridConfig,

    /// Archived scans location.
    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Helper method to create a sample config file when validation fails
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Original path: {:?}, Sample path: {:?}", path, sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    ///
    /// A missing file is created with the default values. A file that does not
    /// pass schema validation, deserialization or the additional rules leaves a
    /// `<name>.sample.yaml` next to it and returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        // An empty document is a valid, all-default configuration
        let yaml_value: serde_yml::Value = if contents.trim().is_empty() {
            serde_yml::Value::Mapping(Default::default())
        } else {
            serde_yml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?
        };

        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", path)
        })?;

        let validator = schema_validator()?;

        debug!("Validating {} configuration against schema", path.display());
        if let Err(error) = validator.validate(&json_value) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        debug!("Schema validation passed, deserializing into Config structure");
        let config: Config = match serde_json::from_value(json_value) {
            Ok(config) => config,
            Err(err) => {
                error!("Configuration deserialization error: {}", err);
                if let Err(e) = Self::create_sample_config(path) {
                    error!("Failed to create sample config: {}", e);
                }
                return Err(anyhow::anyhow!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                ));
            }
        };

        if let Err(err) = utils::validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Validate an in-memory configuration against the schema and the
    /// additional rules, without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        let json_value =
            serde_json::to_value(self).context("Failed to serialize configuration to JSON")?;
        let validator = schema_validator()?;
        if let Err(error) = validator.validate(&json_value) {
            anyhow::bail!("Configuration validation failed: {}", error);
        }
        utils::validate_specific_rules(self)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// Only explicitly provided values override the loaded configuration.
    ///
    /// # Parameters
    ///
    /// * `web_port` - TCP port of the web server
    /// * `web_address` - Network address the web server binds to
    /// * `server_mode` - If true, ensures the web server is enabled
    /// * `serial_port` - Explicit serial device, bypassing discovery
    /// * `baud_rate` - Serial baud rate
    /// * `archive_dir` - Directory holding archived scans
    pub fn apply_args(
        &mut self,
        web_port: Option<u16>,
        web_address: Option<String>,
        server_mode: bool,
        serial_port: Option<String>,
        baud_rate: Option<u32>,
        archive_dir: Option<PathBuf>,
    ) {
        if let Some(web_port) = web_port {
            debug!("Overriding port from command line: {}", web_port);
            self.server.port = web_port;
        }

        if let Some(web_address) = web_address {
            debug!("Overriding address from command line: {}", web_address);
            self.server.address = web_address;
        }

        if server_mode {
            self.server.enabled = true;
        }

        if let Some(port) = serial_port {
            debug!("Overriding serial port from command line: {}", port);
            self.serial.port = Some(port);
        }

        if let Some(baud) = baud_rate {
            debug!("Overriding baud rate from command line: {}", baud);
            self.serial.baud_rate = baud;
        }

        if let Some(dir) = archive_dir {
            debug!("Overriding archive directory from command line: {:?}", dir);
            self.archive.directory = dir;
        }
    }
}

fn schema_validator() -> Result<jsonschema::Validator> {
    let schema_str = include_str!("../../resources/config.schema.json");
    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

    let validator = jsonschema::draft202012::options()
        .should_validate_formats(true)
        .build(&schema)?;
    Ok(validator)
}
