// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Async runner for a scan session
//!
//! The [`SessionDriver`] owns one [`ScanSession`] and serializes everything
//! that touches it: operator requests coming through a [`SessionHandle`],
//! telemetry received by its viewer, and the demo tick it schedules.

use std::future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use super::{Axis, DataSource, Outcome, ScanSession, SessionSnapshot, TickToken};
use crate::acquisition::stream::{Envelope, Viewer};

/// Operator operations on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SwitchDataSource(DataSource),
    StartScan,
    PauseScan,
    ResumeScan,
    EmergencyStop,
    CompleteScan,
    SelectArchive(String),
    Jog { axis: Axis, forward: bool },
    MoveTo { axis: Axis, index: i64 },
    Home,
    ScanPoint,
}

/// Request sent to a running driver.
#[derive(Debug)]
pub enum SessionRequest {
    Apply(SessionCommand, oneshot::Sender<Outcome>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Cloneable handle to a running [`SessionDriver`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Apply an operation and wait for its outcome.
    pub async fn apply(&self, command: SessionCommand) -> Result<Outcome> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(SessionRequest::Apply(command, reply))
            .await
            .map_err(|_| anyhow!("Session driver stopped"))?;
        outcome.await.map_err(|_| anyhow!("Session driver stopped"))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.requests
            .send(SessionRequest::Snapshot(reply))
            .await
            .map_err(|_| anyhow!("Session driver stopped"))?;
        snapshot.await.map_err(|_| anyhow!("Session driver stopped"))
    }
}

/// Owns a session and drives it until every handle is dropped.
pub struct SessionDriver {
    session: ScanSession,
    viewer: Option<Viewer>,
    requests: mpsc::Receiver<SessionRequest>,
    tick_interval: Duration,
}

impl SessionDriver {
    /// Create a driver and its handle.
    ///
    /// ### Parameters
    /// * `session` - The session to drive
    /// * `viewer` - Telemetry feed applied to the session, if any
    /// * `tick_interval` - Delay between two demo ticks
    ///
    /// ### Returns
    /// The driver, to be spawned with [`SessionDriver::run`], and a handle
    /// to send it requests
    pub fn new(
        session: ScanSession,
        viewer: Option<Viewer>,
        tick_interval: Duration,
    ) -> (Self, SessionHandle) {
        let (sender, requests) = mpsc::channel(32);
        (
            Self {
                session,
                viewer,
                requests,
                tick_interval,
            },
            SessionHandle { requests: sender },
        )
    }

    /// Run until every [`SessionHandle`] is dropped.
    pub async fn run(mut self) {
        let mut armed: Option<(TickToken, Instant)> = None;
        loop {
            // Keep the deadline of a tick that is still pending
            armed = match (self.session.pending_tick(), armed) {
                (Some(token), Some((current, at))) if token == current => Some((token, at)),
                (Some(token), _) => Some((token, Instant::now() + self.tick_interval)),
                (None, _) => None,
            };
            let deadline = armed.map(|(_, at)| at);

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => {
                        debug!("All session handles dropped, stopping driver");
                        break;
                    }
                },
                event = next_envelope(&mut self.viewer) => match event {
                    Some(envelope) => self.session.apply_event(&envelope),
                    None => {
                        warn!("Telemetry stream closed");
                        self.viewer = None;
                    }
                },
                _ = wait_until(deadline) => {
                    if let Some((token, _)) = armed.take() {
                        self.session.on_tick(token);
                    }
                }
            }
        }
    }

    fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Apply(command, reply) => {
                let outcome = self.apply(command.clone());
                debug!("Session {:?}: {:?}", command, outcome);
                let _ = reply.send(outcome);
            }
            SessionRequest::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
        }
    }

    fn apply(&mut self, command: SessionCommand) -> Outcome {
        let session = &mut self.session;
        match command {
            SessionCommand::SwitchDataSource(source) => session.switch_data_source(source),
            SessionCommand::StartScan => session.start_scan(),
            SessionCommand::PauseScan => session.pause_scan(),
            SessionCommand::ResumeScan => session.resume_scan(),
            SessionCommand::EmergencyStop => session.emergency_stop(),
            SessionCommand::CompleteScan => session.complete_scan(),
            SessionCommand::SelectArchive(filename) => session.select_archive(&filename),
            SessionCommand::Jog { axis, forward } => session.jog(axis, forward),
            SessionCommand::MoveTo { axis, index } => session.move_to(axis, index),
            SessionCommand::Home => session.home(),
            SessionCommand::ScanPoint => session.scan_point(),
        }
    }
}

async fn next_envelope(viewer: &mut Option<Viewer>) -> Option<Envelope> {
    match viewer {
        Some(viewer) => viewer.next_event().await,
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}
