// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Telemetry broadcast
//!
//! This module fans the device link events out to every connected viewer and
//! relays viewer commands back to the link. Each published event is wrapped
//! in an [`Envelope`] carrying a process-wide sequence number, which lets
//! viewers order controller statuses against their own optimistic updates.
//!
//! Only published events advance the sequence. Events addressed to a single
//! viewer (its connection snapshot, command errors) carry the number of the
//! last published event that viewer has been handed, so every viewer sees a
//! contiguous run of numbers from its snapshot on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::device_link::{DeviceLink, LinkError};
use super::{ConnectionStatus, ControllerStatus, LinkEvent, TelemetrySample};

/// A sample as sent to viewers, stamped with its server receipt time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub grid_x: i64,
    pub grid_y: i64,
    pub timestamp: i64,
    pub server_timestamp: DateTime<Utc>,
}

impl SensorData {
    pub fn new(sample: TelemetrySample, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            x: sample.x,
            y: sample.y,
            z: sample.z,
            grid_x: sample.grid_x,
            grid_y: sample.grid_y,
            timestamp: sample.timestamp,
            server_timestamp,
        }
    }

    pub fn sample(&self) -> TelemetrySample {
        TelemetrySample {
            x: self.x,
            y: self.y,
            z: self.z,
            grid_x: self.grid_x,
            grid_y: self.grid_y,
            timestamp: self.timestamp,
        }
    }
}

/// Event delivered to viewers over the telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TelemetryEvent {
    ConnectionStatus(ConnectionStatus),
    SensorData(SensorData),
    ArduinoStatus {
        status: ControllerStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RawData {
        raw: String,
        timestamp: DateTime<Utc>,
    },
    /// Sent to a single viewer, e.g. when its command could not be relayed.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl From<LinkEvent> for TelemetryEvent {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::Connection(status) => Self::ConnectionStatus(status),
            LinkEvent::Sample {
                sample,
                received_at,
            } => Self::SensorData(SensorData::new(sample, received_at)),
            LinkEvent::Status(status) => Self::ArduinoStatus {
                status: status.status,
                message: status.message.unwrap_or_default(),
                timestamp: status.timestamp,
            },
            LinkEvent::Raw { line, received_at } => Self::RawData {
                raw: line,
                timestamp: received_at,
            },
        }
    }
}

/// A sequenced telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Statistics about the telemetry broadcast
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastStats {
    /// Total number of events published
    pub total_events: u64,
    /// Events skipped by lagging viewers, summed over all viewers
    pub lagged_events: u64,
    /// Number of connected viewers
    pub active_viewers: usize,
    /// Number of viewers connected since start
    pub viewers_served: u64,
}

#[derive(Debug, Clone)]
struct ViewerInfo {
    connected_at: DateTime<Utc>,
}

/// Fans link events out to viewers and relays their commands.
pub struct TelemetryBroadcaster {
    link: Arc<DeviceLink>,
    sender: broadcast::Sender<Envelope>,
    /// Sequence number of the last published event. Held while sending so
    /// channel order matches sequence order.
    last_seq: Mutex<u64>,
    total_events: AtomicU64,
    lagged_events: AtomicU64,
    viewers_served: AtomicU64,
    viewers: RwLock<HashMap<Uuid, ViewerInfo>>,
}

impl TelemetryBroadcaster {
    /// Create a broadcaster over `link`.
    ///
    /// ### Parameters
    /// * `link` - The device link whose events are relayed
    /// * `buffer_size` - Events buffered per viewer before it starts lagging
    pub fn new(link: Arc<DeviceLink>, buffer_size: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Arc::new(Self {
            link,
            sender,
            last_seq: Mutex::new(0),
            total_events: AtomicU64::new(0),
            lagged_events: AtomicU64::new(0),
            viewers_served: AtomicU64::new(0),
            viewers: RwLock::new(HashMap::new()),
        })
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Publish an event to every connected viewer.
    pub fn publish(&self, event: TelemetryEvent) -> Envelope {
        let mut last_seq = self.last_seq.lock().unwrap_or_else(|e| e.into_inner());
        *last_seq += 1;
        let envelope = Envelope {
            seq: *last_seq,
            event,
        };
        // No viewer connected is not an error
        let _ = self.sender.send(envelope.clone());
        drop(last_seq);
        self.total_events.fetch_add(1, Ordering::Relaxed);
        envelope
    }

    /// Spawn the task relaying link events to the viewers.
    ///
    /// Events emitted by the link before this call are not relayed.
    pub fn start_relay(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.link.subscribe();
        let broadcaster = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        broadcaster.publish(event.into());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Telemetry relay lagged behind, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Device link event channel closed, stopping relay");
                        break;
                    }
                }
            }
        })
    }

    /// Register a new viewer.
    ///
    /// The first event the viewer receives is a snapshot of the link
    /// connection status.
    pub fn connect_viewer(self: &Arc<Self>) -> Viewer {
        let (receiver, position) = {
            let last_seq = self.last_seq.lock().unwrap_or_else(|e| e.into_inner());
            (self.sender.subscribe(), *last_seq)
        };
        let id = Uuid::new_v4();
        {
            let mut viewers = self.viewers.write().unwrap_or_else(|e| e.into_inner());
            viewers.insert(
                id,
                ViewerInfo {
                    connected_at: Utc::now(),
                },
            );
        }
        self.viewers_served.fetch_add(1, Ordering::Relaxed);
        info!("Viewer {} connected", id);

        let snapshot = Envelope {
            seq: position,
            event: TelemetryEvent::ConnectionStatus(self.link.status().connection_status()),
        };
        Viewer {
            id,
            receiver,
            pending: VecDeque::from([snapshot]),
            position,
            broadcaster: self.clone(),
        }
    }

    fn disconnect_viewer(&self, id: &Uuid) {
        let removed = {
            let mut viewers = self.viewers.write().unwrap_or_else(|e| e.into_inner());
            viewers.remove(id)
        };
        if let Some(info) = removed {
            let duration = Utc::now() - info.connected_at;
            info!(
                "Viewer {} disconnected after {}s",
                id,
                duration.num_seconds()
            );
        }
    }

    /// Relay a command to the controller on behalf of a non-viewer caller.
    pub fn relay_command(&self, command: &str) -> Result<(), LinkError> {
        self.link.send(command)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            total_events: self.total_events.load(Ordering::Relaxed),
            lagged_events: self.lagged_events.load(Ordering::Relaxed),
            active_viewers: self.viewer_count(),
            viewers_served: self.viewers_served.load(Ordering::Relaxed),
        }
    }
}

/// A connected viewer.
///
/// Dropping the viewer removes it from the broadcast; nothing is sent to the
/// controller.
pub struct Viewer {
    id: Uuid,
    receiver: broadcast::Receiver<Envelope>,
    pending: VecDeque<Envelope>,
    /// Sequence number of the last published event handed to this viewer
    position: u64,
    broadcaster: Arc<TelemetryBroadcaster>,
}

impl Viewer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next event addressed to this viewer.
    ///
    /// Returns `None` once the broadcaster is gone. A lagging viewer skips the
    /// events it missed.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }

        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    self.position = envelope.seq;
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Viewer {} lagged behind, skipped {} events", self.id, skipped);
                    self.broadcaster
                        .lagged_events
                        .fetch_add(skipped, Ordering::Relaxed);
                }
            }
        }
    }

    /// Forward a command to the controller.
    ///
    /// When the link is not open, an `error` event is queued for this viewer
    /// only and the error is returned.
    pub fn send_command(&mut self, command: &str) -> Result<(), LinkError> {
        match self.broadcaster.link.send(command) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!("Viewer {} command {:?} rejected: {}", self.id, command, err);
                self.pending.push_back(Envelope {
                    seq: self.position,
                    event: TelemetryEvent::Error {
                        message: err.to_string(),
                        timestamp: Utc::now(),
                    },
                });
                Err(err)
            }
        }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.broadcaster.disconnect_viewer(&self.id);
    }
}
