// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::Result;
use clap::Parser;
use gantry_control::config::{self, Config};
use gantry_control::daemon::Daemon;
use gantry_control::session::DataSource;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Scanning gantry control server")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Validate the configuration file and exit
    #[arg(long)]
    validate_config: bool,

    /// Output the configuration JSON schema and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Web server port
    #[arg(short = 'p', long)]
    web_port: Option<u16>,

    /// Web server address
    #[arg(short = 'a', long)]
    web_address: Option<String>,

    /// Serial port of the controller, bypassing discovery
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Directory holding the archived scans
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Run a headless scan session (live or demo) and log its progress
    #[arg(long, value_name = "SOURCE")]
    session: Option<DataSource>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable all logging
    #[arg(short, long)]
    quiet: bool,
}

#[rocket::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        config::output_config_schema()?;
        return Ok(());
    }

    if args.validate_config {
        return match Config::from_file(&args.config) {
            Ok(_) => {
                info!("Configuration file {:?} is valid", args.config);
                Ok(())
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                Err(e)
            }
        };
    }

    let mut config = Config::from_file(&args.config)?;
    config.apply_args(
        args.web_port,
        args.web_address,
        args.session.is_none(),
        args.serial_port,
        args.baud_rate,
        args.archive_dir,
    );

    if args.session == Some(DataSource::Historical) {
        anyhow::bail!("Headless sessions only run live or demo scans");
    }

    let mut daemon = Daemon::new();
    daemon.launch(&config).await?;

    if let Some(source) = args.session {
        // The session stops once its progress monitor ends
        daemon.start_headless_session(&config, source)?;
    }

    info!("Gantry control running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    daemon.shutdown().await;
    daemon.join().await?;
    info!("Gantry control stopped");
    Ok(())
}
