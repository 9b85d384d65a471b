// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::acquisition::{DeviceLink, PortResolver, TelemetryBroadcaster};
use crate::archive::ArchiveIndex;
use crate::config::Config;
use crate::session::{
    DataSource, ScanPhase, ScanSession, SessionCommand, SessionDriver, SessionHandle,
};
use crate::visualization::server::{build_rocket, LinkControl, ServerState};
use base64::prelude::*;
use rocket::{
    config::LogLevel,
    data::{Limits, ToByteUnit},
};

/// Seconds between two heartbeat log lines
const HEARTBEAT_PERIOD: u64 = 60;

/// Represents a daemon task that can be started and managed
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    broadcaster: Option<Arc<TelemetryBroadcaster>>,
    relay: Option<JoinHandle<()>>,
    web_shutdown: Option<rocket::Shutdown>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            broadcaster: None,
            relay: None,
            web_shutdown: None,
        }
    }

    /// Launch all configured tasks based on configuration
    pub async fn launch(&mut self, config: &Config) -> Result<()> {
        let broadcaster = self.start_link(config).await;

        // Start web server if enabled
        if config.server.enabled {
            self.start_web_server(config, broadcaster).await?;
        }

        // Start heartbeat task for monitoring
        self.start_heartbeat()?;

        Ok(())
    }

    /// Create the device link and the telemetry relay, then connect.
    ///
    /// A controller that cannot be found or opened is not fatal: the link
    /// stays down until a reconnect is requested.
    async fn start_link(&mut self, config: &Config) -> Arc<TelemetryBroadcaster> {
        let link = Arc::new(DeviceLink::new(
            &config.serial,
            config.grid,
            config.broadcast.buffer_size,
        ));
        let broadcaster = TelemetryBroadcaster::new(link.clone(), config.broadcast.buffer_size);
        self.relay = Some(broadcaster.start_relay());
        self.broadcaster = Some(broadcaster.clone());

        if config.serial.auto_connect {
            let resolver = PortResolver::system(config.serial.signatures.clone());
            match link.connect(&resolver, config.serial.port.as_deref()).await {
                Ok(port) => info!("Controller link open on {}", port),
                Err(err) => warn!("Controller not connected: {}", err),
            }
        } else {
            info!("Automatic connection disabled, waiting for a reconnect request");
        }

        broadcaster
    }

    /// Start the Rocket web server
    async fn start_web_server(
        &mut self,
        config: &Config,
        broadcaster: Arc<TelemetryBroadcaster>,
    ) -> Result<()> {
        info!(
            "Starting web server on {}:{}",
            config.server.address, config.server.port
        );

        let mut figment = rocket::Config::figment()
            .merge(("ident", config.server.name.clone()))
            .merge(("limits", Limits::new().limit("json", 2.mebibytes())))
            .merge(("address", config.server.address.clone()))
            .merge(("port", config.server.port))
            .merge(("log_level", LogLevel::Normal));

        // Configure TLS if certificates are provided
        if let (Some(cert), Some(key)) = (&config.server.cert, &config.server.key) {
            debug!("SSL certificates found in configuration, enabling TLS");

            // Decode base64 certificates
            let cert_data = BASE64_STANDARD
                .decode(cert)
                .context("Invalid base64 certificate")?;
            let key_data = BASE64_STANDARD
                .decode(key)
                .context("Invalid base64 key")?;

            // Configure TLS
            figment = figment
                .merge(("tls.certs", cert_data))
                .merge(("tls.key", key_data));

            info!("TLS enabled for web server");
        }

        let state = ServerState {
            broadcaster,
            archive: ArchiveIndex::new(&config.archive.directory, config.grid),
            link_control: LinkControl {
                resolver: PortResolver::system(config.serial.signatures.clone()),
                forced_port: config.serial.port.clone(),
            },
        };
        let rocket = build_rocket(figment, state).await;
        let ignited = rocket
            .ignite()
            .await
            .context("Failed to configure the web server")?;
        self.web_shutdown = Some(ignited.shutdown());

        let task = tokio::spawn(async move {
            ignited.launch().await?;
            Ok::<_, anyhow::Error>(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Run a scan session inside the daemon and log its progress.
    ///
    /// The session follows the broadcast telemetry like any other viewer.
    /// Must be called after [`Daemon::launch`].
    pub fn start_headless_session(
        &mut self,
        config: &Config,
        source: DataSource,
    ) -> Result<SessionHandle> {
        let broadcaster = self
            .broadcaster
            .clone()
            .context("Daemon must be launched before starting a session")?;
        info!("Starting headless {} session", source);

        let session = ScanSession::new(
            config.grid,
            &config.session,
            Box::new(broadcaster.link().clone()),
            Box::new(ArchiveIndex::new(&config.archive.directory, config.grid)),
        );
        let interval = Duration::from_millis(config.session.tick_interval_ms);
        let (driver, handle) =
            SessionDriver::new(session, Some(broadcaster.connect_viewer()), interval);
        self.tasks.push(tokio::spawn(async move {
            driver.run().await;
            Ok(())
        }));

        let monitor = handle.clone();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            monitor
                .apply(SessionCommand::SwitchDataSource(source))
                .await?;
            let outcome = monitor.apply(SessionCommand::StartScan).await?;
            if !outcome.is_applied() {
                warn!("Headless scan not started: {:?}", outcome);
                return Ok(());
            }

            let mut reported = 0;
            while running.load(Ordering::SeqCst) {
                time::sleep(interval).await;
                let snapshot = monitor.snapshot().await?;
                match snapshot.progress {
                    Some(progress) if progress.current != reported => {
                        reported = progress.current;
                        info!("Scan progress: {}/{}", progress.current, progress.total);
                    }
                    None if snapshot.phase == ScanPhase::Idle && reported > 0 => {
                        info!("Scan finished with {} points", snapshot.points);
                        break;
                    }
                    _ => {}
                }
            }
            Ok::<_, anyhow::Error>(())
        });
        self.tasks.push(task);

        Ok(handle)
    }

    /// Start a heartbeat task that logs system status periodically
    fn start_heartbeat(&mut self) -> Result<()> {
        debug!("Starting heartbeat monitor");

        let running = self.running.clone();
        let broadcaster = self.broadcaster.clone();
        let task = tokio::spawn(async move {
            let mut elapsed = 0u64;
            while running.load(Ordering::SeqCst) {
                time::sleep(Duration::from_secs(1)).await;
                elapsed += 1;
                if elapsed % HEARTBEAT_PERIOD != 0 {
                    continue;
                }
                match &broadcaster {
                    Some(broadcaster) => {
                        let stats = broadcaster.stats();
                        debug!(
                            "Daemon heartbeat: link {:?}, {} viewer(s), {} event(s) published",
                            broadcaster.link().status().state,
                            stats.active_viewers,
                            stats.total_events
                        );
                    }
                    None => debug!("Daemon heartbeat: running"),
                }
            }
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Stop all running tasks
    ///
    /// The serial port is released when this returns.
    pub async fn shutdown(&self) {
        info!("Shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = &self.web_shutdown {
            shutdown.clone().notify();
        }
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.link().close().await;
        }
        if let Some(relay) = &self.relay {
            relay.abort();
        }
    }

    /// Wait for all tasks to complete
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match task.await {
                Ok(Err(e)) => log::error!("Task failed: {}", e),
                Err(e) => log::error!("Task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }
}
