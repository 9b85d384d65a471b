// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Viewer-side scan session
//!
//! A [`ScanSession`] keeps one viewer's picture of the gantry coherent across
//! three mutually exclusive data sources:
//!
//! - **live**: samples and statuses come from the controller, commands are
//!   relayed to it
//! - **demo**: a local sweep synthesizes one sample per tick
//! - **historical**: points are loaded from an archived scan
//!
//! The session is a plain state machine. Effects go through the
//! [`CommandSink`] and [`ArchiveSource`] collaborators, and the demo tick is
//! exposed as a [`TickToken`] that the owner fires after the configured
//! interval (see [`driver`]).
//!
//! ```text
//!            start              pause
//!   idle ───────────▶ scanning ───────▶ paused
//!    ▲                 │    ▲            │
//!    │   complete /    │    └── resume ──┘
//!    └── emergency ────┘
//! ```

pub mod demo;
pub mod driver;
pub mod messages;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::acquisition::stream::{Envelope, TelemetryEvent};
use crate::acquisition::{ControllerStatus, DeviceLink, LinkError, TelemetrySample};
use crate::archive::{ArchiveData, ArchiveError, ArchiveFile, ArchiveIndex};
use crate::config::{GridConfig, SessionConfig};
use demo::SweepCursor;
use messages::MessageLog;

pub use driver::{SessionCommand, SessionDriver, SessionHandle, SessionRequest};

/// Controller command tokens.
pub mod commands {
    pub const START_SCAN: &str = "START_SCAN";
    /// Pauses the running scan.
    pub const STOP_SCAN: &str = "STOP_SCAN";
    pub const RESUME_SCAN: &str = "RESUME_SCAN";
    pub const EMERGENCY_STOP: &str = "EMERGENCY_STOP";
    pub const SCAN_POINT: &str = "SCAN_POINT";
    pub const HOME: &str = "HOME";
    pub const MOVE_X_PLUS: &str = "MOVE_X_PLUS";
    pub const MOVE_X_MINUS: &str = "MOVE_X_MINUS";
    pub const MOVE_Y_PLUS: &str = "MOVE_Y_PLUS";
    pub const MOVE_Y_MINUS: &str = "MOVE_Y_MINUS";
    pub const MOVE_TO_X: &str = "MOVE_TO_X";
    pub const MOVE_TO_Y: &str = "MOVE_TO_Y";
}

/// Relays commands to the controller.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink: Send + Sync {
    fn send(&self, command: &str) -> Result<(), LinkError>;
}

impl CommandSink for DeviceLink {
    fn send(&self, command: &str) -> Result<(), LinkError> {
        DeviceLink::send(self, command)
    }
}

impl<T: CommandSink + ?Sized> CommandSink for Arc<T> {
    fn send(&self, command: &str) -> Result<(), LinkError> {
        (**self).send(command)
    }
}

/// Provides archived scans.
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveSource: Send + Sync {
    fn list(&self) -> Result<Vec<ArchiveFile>, ArchiveError>;
    fn read(&self, filename: &str) -> Result<ArchiveData, ArchiveError>;
}

impl ArchiveSource for ArchiveIndex {
    fn list(&self) -> Result<Vec<ArchiveFile>, ArchiveError> {
        ArchiveIndex::list(self)
    }

    fn read(&self, filename: &str) -> Result<ArchiveData, ArchiveError> {
        ArchiveIndex::read(self, filename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Demo,
    Historical,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Demo => "demo",
            Self::Historical => "historical",
        })
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "demo" => Ok(Self::Demo),
            "historical" => Ok(Self::Historical),
            other => Err(format!("unknown data source: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Idle,
    Scanning,
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPosition {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

/// Identifies one scheduled demo tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickToken(u64);

/// Result of a session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation took effect.
    Applied,
    /// Nothing to do in the current state.
    NoOp(String),
    /// Not allowed in the current state or data source.
    Rejected(String),
    /// A collaborator failed (relay or archive).
    Failed(String),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub data_source: DataSource,
    pub phase: ScanPhase,
    pub position: GridPosition,
    pub points: usize,
    pub selected_archive: Option<String>,
    pub progress: Option<Progress>,
    pub link_connected: bool,
    pub tick_pending: bool,
}

/// Scan state of one viewer.
pub struct ScanSession {
    grid: GridConfig,
    source: DataSource,
    phase: ScanPhase,
    position: GridPosition,
    points: Vec<TelemetrySample>,
    selected_archive: Option<String>,
    archive_files: Vec<ArchiveFile>,
    /// Progress denominator, fixed when a scan starts.
    progress_total: Option<u64>,
    cursor: SweepCursor,
    tick_epoch: u64,
    pending_tick: Option<TickToken>,
    last_status_seq: u64,
    /// Set by an emergency stop in live mode; scanning/paused statuses are
    /// ignored until the operator starts or resumes again.
    halted: bool,
    link_connected: bool,
    messages: MessageLog,
    commands: Box<dyn CommandSink>,
    archive: Box<dyn ArchiveSource>,
    rng: Box<dyn RngCore + Send>,
}

impl ScanSession {
    /// Create a session in demo mode.
    pub fn new(
        grid: GridConfig,
        config: &SessionConfig,
        commands: Box<dyn CommandSink>,
        archive: Box<dyn ArchiveSource>,
    ) -> Self {
        Self::with_rng(grid, config, commands, archive, Box::new(StdRng::from_os_rng()))
    }

    /// Create a session with a given noise generator.
    pub fn with_rng(
        grid: GridConfig,
        config: &SessionConfig,
        commands: Box<dyn CommandSink>,
        archive: Box<dyn ArchiveSource>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            grid,
            source: DataSource::Demo,
            phase: ScanPhase::Idle,
            position: GridPosition::default(),
            points: Vec::new(),
            selected_archive: None,
            archive_files: Vec::new(),
            progress_total: None,
            cursor: SweepCursor::new(&grid),
            tick_epoch: 0,
            pending_tick: None,
            last_status_seq: 0,
            halted: false,
            link_connected: false,
            messages: MessageLog::new(config.message_log_len),
            commands,
            archive,
            rng,
        }
    }

    pub fn data_source(&self) -> DataSource {
        self.source
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn position(&self) -> GridPosition {
        self.position
    }

    pub fn points(&self) -> &[TelemetrySample] {
        &self.points
    }

    pub fn selected_archive(&self) -> Option<&str> {
        self.selected_archive.as_deref()
    }

    pub fn archive_files(&self) -> &[ArchiveFile] {
        &self.archive_files
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn is_link_connected(&self) -> bool {
        self.link_connected
    }

    /// Whether hardware controls should be offered to the operator.
    pub fn controls_enabled(&self) -> bool {
        match self.source {
            DataSource::Live => self.link_connected,
            DataSource::Demo => true,
            DataSource::Historical => false,
        }
    }

    /// Scan progress, while a live or demo scan is running.
    pub fn progress(&self) -> Option<Progress> {
        if self.phase != ScanPhase::Scanning || self.source == DataSource::Historical {
            return None;
        }
        self.progress_total.map(|total| Progress {
            current: self.points.len() as u64,
            total,
        })
    }

    /// The demo tick waiting to be fired, if any.
    pub fn pending_tick(&self) -> Option<TickToken> {
        self.pending_tick
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            data_source: self.source,
            phase: self.phase,
            position: self.position,
            points: self.points.len(),
            selected_archive: self.selected_archive.clone(),
            progress: self.progress(),
            link_connected: self.link_connected,
            tick_pending: self.pending_tick.is_some(),
        }
    }

    fn schedule_tick(&mut self) {
        self.tick_epoch += 1;
        self.pending_tick = Some(TickToken(self.tick_epoch));
    }

    fn cancel_tick(&mut self) {
        self.pending_tick = None;
    }

    fn relay(&mut self, command: &str) -> Result<(), String> {
        self.commands.send(command).map_err(|err| {
            warn!("Command {} not relayed: {}", command, err);
            self.messages
                .error(format!("Command {} failed: {}", command, err));
            err.to_string()
        })
    }

    fn reset_to_idle(&mut self) {
        self.cancel_tick();
        self.phase = ScanPhase::Idle;
        self.position = GridPosition::default();
        self.progress_total = None;
        self.cursor.reset();
    }

    fn begin_scan(&mut self) {
        self.points.clear();
        self.progress_total = Some(self.grid.cell_count());
        self.phase = ScanPhase::Scanning;
        self.halted = false;
    }

    /// Switch to another data source.
    ///
    /// Always legal. Stops any scan, clears the points and the selected
    /// archive, and moves back to the origin. Switching to historical lists
    /// the available archives.
    pub fn switch_data_source(&mut self, source: DataSource) -> Outcome {
        self.reset_to_idle();
        self.source = source;
        self.points.clear();
        self.selected_archive = None;
        self.archive_files.clear();
        self.halted = false;

        match source {
            DataSource::Live => {
                if self.link_connected {
                    self.messages.info("Switched to live controller data");
                } else {
                    self.messages
                        .warning("Controller not connected, no live data available");
                }
            }
            DataSource::Demo => self.messages.info("Switched to demo mode with simulated data"),
            DataSource::Historical => {
                self.messages.info("Switched to historical data mode");
                match self.archive.list() {
                    Ok(files) => self.archive_files = files,
                    Err(err) => {
                        warn!("Failed to list archives: {}", err);
                        self.messages.error("Failed to load historical files");
                    }
                }
            }
        }
        info!("Session data source is now {}", source);
        Outcome::Applied
    }

    /// Start a full scan.
    pub fn start_scan(&mut self) -> Outcome {
        if self.phase == ScanPhase::Scanning {
            self.messages.info("Scan already running");
            return Outcome::NoOp("scan already running".to_string());
        }

        match self.source {
            DataSource::Historical => {
                self.messages
                    .warning("Cannot start scan: switch to live or demo mode");
                Outcome::Rejected("cannot scan in this mode".to_string())
            }
            DataSource::Live => {
                if let Err(err) = self.relay(commands::START_SCAN) {
                    return Outcome::Failed(err);
                }
                self.begin_scan();
                self.messages.info("Starting live scan");
                Outcome::Applied
            }
            DataSource::Demo => {
                self.reset_to_idle();
                self.begin_scan();
                self.schedule_tick();
                self.messages.info("Starting demo scan from position (0,0)");
                Outcome::Applied
            }
        }
    }

    /// Pause the running scan.
    ///
    /// The local pause always happens. In live mode a failure to relay the
    /// stop command is logged for the operator.
    pub fn pause_scan(&mut self) -> Outcome {
        if self.source == DataSource::Historical {
            return Outcome::Rejected("cannot scan in this mode".to_string());
        }
        if self.phase != ScanPhase::Scanning {
            return Outcome::NoOp("no scan running".to_string());
        }

        if self.source == DataSource::Live {
            let _ = self.relay(commands::STOP_SCAN);
        }
        self.cancel_tick();
        self.phase = ScanPhase::Paused;
        self.messages.info("Scan paused");
        Outcome::Applied
    }

    /// Resume a paused scan where it stopped.
    ///
    /// Like [`Self::pause_scan`], the local transition does not wait for the
    /// controller.
    pub fn resume_scan(&mut self) -> Outcome {
        if self.source == DataSource::Historical {
            return Outcome::Rejected("cannot scan in this mode".to_string());
        }
        if self.phase != ScanPhase::Paused {
            return Outcome::NoOp("no paused scan".to_string());
        }

        match self.source {
            DataSource::Live => {
                let _ = self.relay(commands::RESUME_SCAN);
                self.halted = false;
                self.messages.info("Resuming live scan");
            }
            _ => {
                self.schedule_tick();
                self.messages.info("Resuming demo scan");
            }
        }
        if self.progress_total.is_none() {
            self.progress_total = Some(self.grid.cell_count());
        }
        self.phase = ScanPhase::Scanning;
        Outcome::Applied
    }

    /// Stop everything and return to the origin.
    ///
    /// Legal from any state. In live mode the stop command is also sent to the
    /// controller; a relay failure is reported but the local reset still
    /// happens.
    pub fn emergency_stop(&mut self) -> Outcome {
        self.reset_to_idle();
        self.messages
            .error("EMERGENCY STOP - System reset to initial position");
        if self.source == DataSource::Live {
            self.halted = true;
            let _ = self.relay(commands::EMERGENCY_STOP);
        }
        warn!("Emergency stop in {} mode", self.source);
        Outcome::Applied
    }

    /// Append a sample and move to its cell. Never changes the phase.
    pub fn record_sample(&mut self, sample: TelemetrySample) {
        self.position = GridPosition {
            x: sample.grid_x,
            y: sample.grid_y,
        };
        self.points.push(sample);
    }

    /// End the scan, keeping the collected points.
    pub fn complete_scan(&mut self) -> Outcome {
        self.reset_to_idle();
        self.messages
            .info(format!("Scan completed with {} points", self.points.len()));
        Outcome::Applied
    }

    /// Fire a demo tick.
    ///
    /// Stale tokens, from a tick that was cancelled or superseded, are ignored.
    pub fn on_tick(&mut self, token: TickToken) -> Outcome {
        if self.pending_tick != Some(token) {
            debug!("Ignoring stale tick {:?}", token);
            return Outcome::NoOp("stale tick".to_string());
        }
        self.pending_tick = None;

        if self.source != DataSource::Demo || self.phase != ScanPhase::Scanning {
            return Outcome::NoOp("no demo scan running".to_string());
        }

        match self.cursor.current() {
            None => self.complete_scan(),
            Some((grid_x, grid_y)) => {
                let sample = demo::synthesize(&self.grid, grid_x, grid_y, self.rng.as_mut());
                self.messages.info(format!(
                    "Demo scan: ({},{}) - Height: {:.1}cm",
                    grid_x, grid_y, sample.z
                ));
                self.record_sample(sample);
                self.cursor.advance();
                self.schedule_tick();
                Outcome::Applied
            }
        }
    }

    /// Load an archived scan. Historical mode only.
    pub fn select_archive(&mut self, filename: &str) -> Outcome {
        if self.source != DataSource::Historical {
            return Outcome::Rejected("archives can only be loaded in historical mode".to_string());
        }

        match self.archive.read(filename) {
            Ok(data) => {
                self.position = data
                    .scan_data
                    .last()
                    .map(|p| GridPosition {
                        x: p.grid_x,
                        y: p.grid_y,
                    })
                    .unwrap_or_default();
                self.points = data.scan_data;
                self.selected_archive = Some(data.filename);
                self.messages.info(format!(
                    "Loaded {} points from {}",
                    data.total_points, filename
                ));
                Outcome::Applied
            }
            Err(ArchiveError::InvalidFilename(name)) => {
                self.messages.error(format!("Failed to load {}", name));
                Outcome::Rejected("invalid filename".to_string())
            }
            Err(err) => {
                self.messages.error(format!("Failed to load {}", filename));
                Outcome::Failed(err.to_string())
            }
        }
    }

    fn check_manual(&self) -> Option<Outcome> {
        match (self.source, self.phase) {
            (DataSource::Historical, _) => Some(Outcome::Rejected(
                "manual control is not available in historical mode".to_string(),
            )),
            (_, ScanPhase::Scanning) => Some(Outcome::Rejected(
                "manual control is not available while scanning".to_string(),
            )),
            (DataSource::Live, _) if !self.link_connected => Some(Outcome::Rejected(
                "controller not connected".to_string(),
            )),
            _ => None,
        }
    }

    fn relay_manual(&mut self, command: &str) -> Outcome {
        match self.relay(command) {
            Ok(()) => {
                self.messages
                    .info(format!("Command sent to controller: {}", command));
                Outcome::Applied
            }
            Err(err) => Outcome::Failed(err),
        }
    }

    /// Move one cell along `axis`, forward when `forward` is true.
    pub fn jog(&mut self, axis: Axis, forward: bool) -> Outcome {
        if let Some(outcome) = self.check_manual() {
            return outcome;
        }

        if self.source == DataSource::Live {
            let command = match (axis, forward) {
                (Axis::X, true) => commands::MOVE_X_PLUS,
                (Axis::X, false) => commands::MOVE_X_MINUS,
                (Axis::Y, true) => commands::MOVE_Y_PLUS,
                (Axis::Y, false) => commands::MOVE_Y_MINUS,
            };
            return self.relay_manual(command);
        }

        let step = if forward { 1 } else { -1 };
        let target = match axis {
            Axis::X => GridPosition {
                x: self.position.x + step,
                ..self.position
            },
            Axis::Y => GridPosition {
                y: self.position.y + step,
                ..self.position
            },
        };
        if !self.grid.contains(target.x, target.y) {
            return Outcome::NoOp("already at the edge of the grid".to_string());
        }
        self.position = target;
        self.messages
            .info(format!("Moved to ({},{})", target.x, target.y));
        Outcome::Applied
    }

    /// Move to grid index `index` along `axis`.
    pub fn move_to(&mut self, axis: Axis, index: i64) -> Outcome {
        if let Some(outcome) = self.check_manual() {
            return outcome;
        }

        let in_range = match axis {
            Axis::X => index >= 0 && index < self.grid.width as i64,
            Axis::Y => index >= 0 && index < self.grid.height as i64,
        };
        if !in_range {
            return Outcome::Rejected(format!("{} is outside the grid", index));
        }

        if self.source == DataSource::Live {
            let command = match axis {
                Axis::X => format!("{}:{}", commands::MOVE_TO_X, index),
                Axis::Y => format!("{}:{}", commands::MOVE_TO_Y, index),
            };
            return self.relay_manual(&command);
        }

        match axis {
            Axis::X => self.position.x = index,
            Axis::Y => self.position.y = index,
        }
        self.messages.info(format!(
            "Moved to ({},{})",
            self.position.x, self.position.y
        ));
        Outcome::Applied
    }

    /// Return to the origin.
    pub fn home(&mut self) -> Outcome {
        if let Some(outcome) = self.check_manual() {
            return outcome;
        }
        if self.source == DataSource::Live {
            return self.relay_manual(commands::HOME);
        }
        self.position = GridPosition::default();
        self.messages.info("Moved to home position");
        Outcome::Applied
    }

    /// Measure the current cell only.
    pub fn scan_point(&mut self) -> Outcome {
        if let Some(outcome) = self.check_manual() {
            return outcome;
        }
        if self.source == DataSource::Live {
            return self.relay_manual(commands::SCAN_POINT);
        }
        let sample = demo::synthesize(
            &self.grid,
            self.position.x,
            self.position.y,
            self.rng.as_mut(),
        );
        self.messages.info(format!(
            "Point scanned at ({},{}) - Height: {:.1}",
            self.position.x, self.position.y, sample.z
        ));
        self.record_sample(sample);
        Outcome::Applied
    }

    /// Apply a telemetry event received from the broadcaster.
    pub fn apply_event(&mut self, envelope: &Envelope) {
        match &envelope.event {
            TelemetryEvent::ConnectionStatus(status) => {
                self.link_connected = status.connected;
                if status.connected {
                    self.messages.info(format!(
                        "Controller connected on {}",
                        status.port.as_deref().unwrap_or("unknown port")
                    ));
                } else {
                    self.messages.warning(format!(
                        "Controller disconnected: {}",
                        status.error.as_deref().unwrap_or("Unknown error")
                    ));
                }
            }
            TelemetryEvent::SensorData(data) => {
                if self.source == DataSource::Live {
                    self.messages.info(format!(
                        "Live scan: ({},{}) - Height: {:.1}cm",
                        data.grid_x, data.grid_y, data.z
                    ));
                    self.record_sample(data.sample());
                }
            }
            TelemetryEvent::ArduinoStatus {
                status, message, ..
            } => {
                self.messages
                    .info(format!("Controller: {} - {}", status, message));
                if self.source == DataSource::Live {
                    self.apply_status(envelope.seq, status);
                }
            }
            TelemetryEvent::RawData { raw, .. } => {
                debug!("Raw controller data: {}", raw);
            }
            TelemetryEvent::Error { message, .. } => {
                self.messages.error(message.clone());
            }
        }
    }

    fn apply_status(&mut self, seq: u64, status: &ControllerStatus) {
        if seq <= self.last_status_seq {
            debug!(
                "Ignoring out of order status {} (seq {} <= {})",
                status, seq, self.last_status_seq
            );
            return;
        }
        self.last_status_seq = seq;

        match status {
            ControllerStatus::Scanning | ControllerStatus::Paused if self.halted => {
                debug!("Ignoring {} status after emergency stop", status);
            }
            ControllerStatus::Ready => {
                self.phase = ScanPhase::Idle;
                self.progress_total = None;
                self.halted = false;
            }
            ControllerStatus::Scanning => {
                if self.progress_total.is_none() {
                    self.progress_total = Some(self.grid.cell_count());
                }
                self.phase = ScanPhase::Scanning;
            }
            ControllerStatus::Paused => {
                if self.progress_total.is_none() {
                    self.progress_total = Some(self.grid.cell_count());
                }
                self.phase = ScanPhase::Paused;
            }
            ControllerStatus::Complete => {
                self.halted = false;
                self.complete_scan();
            }
            ControllerStatus::Error => {
                self.phase = ScanPhase::Idle;
                self.progress_total = None;
                self.halted = false;
            }
            ControllerStatus::Connected
            | ControllerStatus::Disconnected
            | ControllerStatus::Other(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::stream::SensorData;
    use crate::acquisition::ConnectionStatus;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Records relayed commands; fails them while disconnected.
    #[derive(Clone, Default)]
    struct FakeLink {
        sent: Arc<Mutex<Vec<String>>>,
        connected: Arc<Mutex<bool>>,
    }

    impl FakeLink {
        fn connected() -> Self {
            let link = Self::default();
            *link.connected.lock().unwrap() = true;
            link
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandSink for FakeLink {
        fn send(&self, command: &str) -> Result<(), LinkError> {
            if !*self.connected.lock().unwrap() {
                return Err(LinkError::NotConnected);
            }
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    fn empty_archive() -> MockArchiveSource {
        let mut archive = MockArchiveSource::new();
        archive.expect_list().returning(|| Ok(Vec::new()));
        archive
    }

    fn session_with(link: FakeLink, grid: GridConfig) -> ScanSession {
        ScanSession::with_rng(
            grid,
            &SessionConfig::default(),
            Box::new(link),
            Box::new(empty_archive()),
            Box::new(StdRng::seed_from_u64(42)),
        )
    }

    fn session() -> ScanSession {
        session_with(FakeLink::default(), GridConfig::default())
    }

    fn live_session(link: FakeLink) -> ScanSession {
        let mut session = session_with(link, GridConfig::default());
        session.switch_data_source(DataSource::Live);
        session
    }

    fn tick(session: &mut ScanSession) -> Outcome {
        let token = session.pending_tick().expect("a tick should be pending");
        session.on_tick(token)
    }

    fn status(seq: u64, status: ControllerStatus) -> Envelope {
        Envelope {
            seq,
            event: TelemetryEvent::ArduinoStatus {
                status,
                message: String::new(),
                timestamp: Utc::now(),
            },
        }
    }

    fn connected(seq: u64) -> Envelope {
        Envelope {
            seq,
            event: TelemetryEvent::ConnectionStatus(ConnectionStatus {
                connected: true,
                port: Some("/dev/ttyACM0".to_string()),
                error: None,
                timestamp: Utc::now(),
            }),
        }
    }

    fn sample_event(seq: u64, grid_x: i64, grid_y: i64) -> Envelope {
        Envelope {
            seq,
            event: TelemetryEvent::SensorData(SensorData::new(
                TelemetrySample {
                    x: grid_x as f64 * 5.0,
                    y: grid_y as f64 * 5.0,
                    z: 3.0,
                    grid_x,
                    grid_y,
                    timestamp: 0,
                },
                Utc::now(),
            )),
        }
    }

    #[test]
    fn test_full_demo_scan() {
        let mut session = session();
        assert!(session.start_scan().is_applied());
        assert_eq!(session.phase(), ScanPhase::Scanning);
        assert_eq!(session.points().len(), 0);

        for _ in 0..300 {
            assert_eq!(tick(&mut session), Outcome::Applied);
        }
        assert_eq!(
            session.progress(),
            Some(Progress {
                current: 300,
                total: 300
            })
        );
        assert_eq!(session.position(), GridPosition { x: 19, y: 14 });

        // The 301st tick completes without recording a sample
        tick(&mut session);
        assert_eq!(session.phase(), ScanPhase::Idle);
        assert_eq!(session.points().len(), 300);
        assert_eq!(session.position(), GridPosition::default());
        assert_eq!(session.pending_tick(), None);
        assert_eq!(session.progress(), None);
    }

    #[test]
    fn test_demo_visits_each_cell_once_row_major() {
        let grid = GridConfig {
            width: 4,
            height: 3,
            step_size: 2.0,
        };
        let mut session = session_with(FakeLink::default(), grid);
        session.start_scan();
        while session.phase() == ScanPhase::Scanning {
            tick(&mut session);
        }

        let cells: Vec<(i64, i64)> = session
            .points()
            .iter()
            .map(|p| (p.grid_x, p.grid_y))
            .collect();
        let expected: Vec<(i64, i64)> = (0..3).flat_map(|y| (0..4).map(move |x| (x, y))).collect();
        assert_eq!(cells, expected);
        assert!(session.points().iter().all(|p| p.z >= 0.0));
        assert_eq!(session.points()[5].x, 2.0);
    }

    #[test]
    fn test_pause_and_resume_demo_keeps_next_cell() {
        let mut session = session();
        session.start_scan();
        tick(&mut session);
        tick(&mut session);

        let stale = session.pending_tick().unwrap();
        assert!(session.pause_scan().is_applied());
        assert_eq!(session.pending_tick(), None);
        assert_eq!(session.on_tick(stale), Outcome::NoOp("stale tick".to_string()));

        assert!(session.resume_scan().is_applied());
        tick(&mut session);
        let last = session.points().last().unwrap();
        assert_eq!((last.grid_x, last.grid_y), (2, 0));
        assert_eq!(session.points().len(), 3);
    }

    #[test]
    fn test_emergency_stop_from_any_state() {
        for setup in 0..3 {
            let mut session = session();
            session.start_scan();
            tick(&mut session);
            tick(&mut session);
            match setup {
                0 => {}
                1 => {
                    session.pause_scan();
                }
                _ => {
                    session.complete_scan();
                }
            }

            assert!(session.emergency_stop().is_applied());
            assert_eq!(session.phase(), ScanPhase::Idle);
            assert_eq!(session.position(), GridPosition::default());
            assert_eq!(session.pending_tick(), None);

            session.start_scan();
            tick(&mut session);
            let first = session.points()[0];
            assert_eq!((first.grid_x, first.grid_y), (0, 0));
        }
    }

    #[test]
    fn test_switch_data_source_is_idempotent() {
        let mut session = session();
        session.start_scan();
        tick(&mut session);

        session.switch_data_source(DataSource::Historical);
        let once = session.snapshot();
        session.switch_data_source(DataSource::Historical);
        assert_eq!(session.snapshot(), once);
        assert_eq!(once.points, 0);
        assert_eq!(once.phase, ScanPhase::Idle);
        assert!(!once.tick_pending);
    }

    #[test]
    fn test_start_in_historical_is_rejected() {
        let mut session = session();
        session.switch_data_source(DataSource::Historical);
        assert_eq!(
            session.start_scan(),
            Outcome::Rejected("cannot scan in this mode".to_string())
        );
        assert_eq!(session.phase(), ScanPhase::Idle);
    }

    #[test]
    fn test_start_while_scanning_is_noop() {
        let mut session = session();
        session.start_scan();
        let token = session.pending_tick();
        assert!(matches!(session.start_scan(), Outcome::NoOp(_)));
        assert_eq!(session.pending_tick(), token);
    }

    #[test]
    fn test_select_archive_positions_at_last_point() {
        let mut archive = MockArchiveSource::new();
        archive.expect_list().returning(|| Ok(Vec::new()));
        archive
            .expect_read()
            .times(1)
            .returning(|name| {
                let point = |gx, gy| TelemetrySample {
                    x: 0.0,
                    y: 0.0,
                    z: 1.0,
                    grid_x: gx,
                    grid_y: gy,
                    timestamp: 0,
                };
                Ok(ArchiveData {
                    filename: name.to_string(),
                    total_points: 2,
                    scan_data: vec![point(0, 0), point(4, 7)],
                })
            });

        let mut session = ScanSession::with_rng(
            GridConfig::default(),
            &SessionConfig::default(),
            Box::new(FakeLink::default()),
            Box::new(archive),
            Box::new(StdRng::seed_from_u64(1)),
        );
        assert!(matches!(
            session.select_archive("gantry_scan_20250101_120000.json"),
            Outcome::Rejected(_)
        ));

        session.switch_data_source(DataSource::Historical);
        assert!(session
            .select_archive("gantry_scan_20250101_120000.json")
            .is_applied());
        assert_eq!(session.points().len(), 2);
        assert_eq!(session.position(), GridPosition { x: 4, y: 7 });
        assert_eq!(
            session.selected_archive(),
            Some("gantry_scan_20250101_120000.json")
        );
        assert_eq!(session.progress(), None);
        assert!(!session.controls_enabled());
    }

    #[test]
    fn test_live_start_relays_and_applies_optimistically() {
        let link = FakeLink::connected();
        let mut session = live_session(link.clone());
        assert!(session.start_scan().is_applied());
        assert_eq!(link.sent(), vec!["START_SCAN"]);
        assert_eq!(session.phase(), ScanPhase::Scanning);
        assert_eq!(session.pending_tick(), None);

        session.apply_event(&sample_event(1, 3, 0));
        assert_eq!(session.position(), GridPosition { x: 3, y: 0 });
        assert_eq!(
            session.progress(),
            Some(Progress {
                current: 1,
                total: 300
            })
        );
    }

    #[test]
    fn test_live_start_without_link_fails_without_state_change() {
        let mut session = live_session(FakeLink::default());
        assert!(matches!(session.start_scan(), Outcome::Failed(_)));
        assert_eq!(session.phase(), ScanPhase::Idle);
    }

    #[test]
    fn test_paused_status_after_optimistic_resume_wins() {
        let link = FakeLink::connected();
        let mut session = live_session(link.clone());
        session.start_scan();
        session.apply_event(&status(10, ControllerStatus::Scanning));
        session.pause_scan();
        session.apply_event(&status(11, ControllerStatus::Paused));

        assert!(session.resume_scan().is_applied());
        assert_eq!(session.phase(), ScanPhase::Scanning);

        session.apply_event(&status(12, ControllerStatus::Paused));
        assert_eq!(session.phase(), ScanPhase::Paused);
        assert_eq!(link.sent(), vec!["START_SCAN", "STOP_SCAN", "RESUME_SCAN"]);
    }

    #[test]
    fn test_pause_and_resume_apply_locally_when_link_drops() {
        let link = FakeLink::connected();
        let mut session = live_session(link.clone());
        session.start_scan();
        *link.connected.lock().unwrap() = false;

        assert!(session.pause_scan().is_applied());
        assert_eq!(session.phase(), ScanPhase::Paused);
        assert!(session
            .messages()
            .entries()
            .any(|e| e.text.contains("STOP_SCAN failed")));

        assert!(session.resume_scan().is_applied());
        assert_eq!(session.phase(), ScanPhase::Scanning);
        assert!(session
            .messages()
            .entries()
            .any(|e| e.text.contains("RESUME_SCAN failed")));
        assert_eq!(link.sent(), vec!["START_SCAN"]);
    }

    #[test]
    fn test_each_point_is_logged_for_the_operator() {
        let mut session = session();
        session.start_scan();
        tick(&mut session);
        assert!(session
            .messages()
            .latest()
            .map(|e| e.text.starts_with("Demo scan: (0,0) - Height: "))
            .unwrap_or(false));

        let mut session = live_session(FakeLink::connected());
        session.start_scan();
        session.apply_event(&sample_event(1, 4, 2));
        assert_eq!(
            session.messages().latest().map(|e| e.text.as_str()),
            Some("Live scan: (4,2) - Height: 3.0cm")
        );
    }

    #[test]
    fn test_out_of_order_status_is_ignored() {
        let mut session = live_session(FakeLink::connected());
        session.start_scan();
        session.apply_event(&status(20, ControllerStatus::Paused));
        session.apply_event(&status(19, ControllerStatus::Scanning));
        assert_eq!(session.phase(), ScanPhase::Paused);
    }

    #[test]
    fn test_emergency_stop_overrides_queued_statuses() {
        let link = FakeLink::connected();
        let mut session = live_session(link.clone());
        session.start_scan();
        assert!(session.emergency_stop().is_applied());
        assert_eq!(link.sent().last().map(String::as_str), Some("EMERGENCY_STOP"));

        // Published before the controller processed the stop
        session.apply_event(&status(30, ControllerStatus::Scanning));
        assert_eq!(session.phase(), ScanPhase::Idle);

        // A new start clears the halt
        session.start_scan();
        session.apply_event(&status(31, ControllerStatus::Scanning));
        assert_eq!(session.phase(), ScanPhase::Scanning);
    }

    #[test]
    fn test_emergency_stop_resets_even_if_relay_fails() {
        let mut session = live_session(FakeLink::default());
        assert!(session.emergency_stop().is_applied());
        assert_eq!(session.phase(), ScanPhase::Idle);
        assert!(session
            .messages()
            .entries()
            .any(|e| e.text.contains("EMERGENCY_STOP failed")));
    }

    #[test]
    fn test_live_complete_status_keeps_points() {
        let mut session = live_session(FakeLink::connected());
        session.start_scan();
        session.apply_event(&sample_event(1, 0, 0));
        session.apply_event(&sample_event(2, 1, 0));
        session.apply_event(&status(3, ControllerStatus::Complete));
        assert_eq!(session.phase(), ScanPhase::Idle);
        assert_eq!(session.points().len(), 2);
        assert_eq!(session.position(), GridPosition::default());
    }

    #[test]
    fn test_samples_ignored_outside_live_mode() {
        let mut session = session();
        session.apply_event(&sample_event(1, 2, 2));
        assert!(session.points().is_empty());
    }

    #[test]
    fn test_connection_status_gates_live_controls() {
        let mut session = live_session(FakeLink::connected());
        assert!(!session.controls_enabled());
        session.apply_event(&connected(1));
        assert!(session.is_link_connected());
        assert!(session.controls_enabled());
    }

    #[test]
    fn test_demo_manual_moves_are_bounded() {
        let mut session = session();
        assert!(matches!(session.jog(Axis::X, false), Outcome::NoOp(_)));
        assert!(session.jog(Axis::X, true).is_applied());
        assert!(session.move_to(Axis::Y, 14).is_applied());
        assert!(matches!(session.jog(Axis::Y, true), Outcome::NoOp(_)));
        assert!(matches!(session.move_to(Axis::X, 20), Outcome::Rejected(_)));
        assert_eq!(session.position(), GridPosition { x: 1, y: 14 });

        assert!(session.scan_point().is_applied());
        let point = session.points()[0];
        assert_eq!((point.grid_x, point.grid_y), (1, 14));

        assert!(session.home().is_applied());
        assert_eq!(session.position(), GridPosition::default());
    }

    #[test]
    fn test_live_manual_commands_are_relayed() {
        let link = FakeLink::connected();
        let mut session = live_session(link.clone());
        assert!(matches!(session.home(), Outcome::Rejected(_)));
        assert!(link.sent().is_empty());

        session.apply_event(&connected(1));
        session.jog(Axis::X, true);
        session.jog(Axis::Y, false);
        session.move_to(Axis::X, 5);
        session.move_to(Axis::Y, 3);
        session.home();
        session.scan_point();
        assert_eq!(
            link.sent(),
            vec![
                "MOVE_X_PLUS",
                "MOVE_Y_MINUS",
                "MOVE_TO_X:5",
                "MOVE_TO_Y:3",
                "HOME",
                "SCAN_POINT"
            ]
        );
        // Position follows the controller, not the commands
        assert_eq!(session.position(), GridPosition::default());
    }

    #[test]
    fn test_manual_control_rejected_while_scanning() {
        let mut session = session();
        session.start_scan();
        assert!(matches!(session.jog(Axis::X, true), Outcome::Rejected(_)));
        assert!(matches!(session.scan_point(), Outcome::Rejected(_)));
    }

    #[test]
    fn test_message_log_is_bounded() {
        let mut session = session();
        for _ in 0..25 {
            session.jog(Axis::X, true);
        }
        assert_eq!(session.messages().len(), 10);
    }
}
