// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serial link to the gantry controller
//!
//! [`DeviceLink`] owns the single connection to the controller. Once a
//! transport is attached, a reader task decodes incoming lines into
//! [`LinkEvent`]s published on a broadcast channel, and a writer task drains
//! the queue of outgoing commands.
//!
//! ```text
//! unopened ──open──▶ open ──eof──▶ closed
//!                      │
//!                      └──error──▶ errored
//! closed / errored ──reconnect──▶ open
//! ```
//!
//! There is no automatic retry: a lost link stays down until an explicit
//! reconnect.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

use super::line_decoder::{LineClassifier, LineSplitter};
use super::port_resolver::PortResolver;
use super::{ConnectionStatus, LinkEvent};
use crate::config::{GridConfig, SerialConfig};

/// Errors reported by the device link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Arduino not connected")]
    NotConnected,

    #[error("No controller serial port found")]
    NoPortFound,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Unopened,
    Open,
    Closed,
    Errored,
}

/// Point-in-time view of the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub port: Option<String>,
    pub error: Option<String>,
}

impl LinkStatus {
    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Connection event describing this status.
    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.is_open(),
            port: self.port.clone(),
            error: self.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

struct Inner {
    state: LinkState,
    port: Option<String>,
    error: Option<String>,
    /// Bumped on every attach and close; tasks of older generations are stale.
    generation: u64,
    commands: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<LinkEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a task panicked mid-update; the state
        // fields are still individually valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_connection(&self, inner: &Inner) {
        let status = ConnectionStatus {
            connected: inner.state == LinkState::Open,
            port: inner.port.clone(),
            error: inner.error.clone(),
            timestamp: Utc::now(),
        };
        // No subscriber is not an error
        let _ = self.events.send(LinkEvent::Connection(status));
    }

    /// Called by the I/O tasks when their transport ends.
    fn finish(&self, generation: u64, failure: Option<String>) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != LinkState::Open {
            debug!("Ignoring end of stale link generation {}", generation);
            return;
        }

        match &failure {
            Some(err) => {
                error!("Controller connection error: {}", err);
                inner.state = LinkState::Errored;
            }
            None => {
                info!("Controller connection closed");
                inner.state = LinkState::Closed;
            }
        }
        inner.error = failure;
        inner.commands = None;
        self.emit_connection(&inner);
    }
}

/// The process-wide connection to the gantry controller.
pub struct DeviceLink {
    shared: Arc<Shared>,
    classifier: LineClassifier,
    baud_rate: u32,
    max_line_bytes: usize,
}

impl DeviceLink {
    /// Create an unopened link.
    ///
    /// ### Parameters
    ///
    /// * `serial` - Serial settings (baud rate, line limit, raw echo)
    /// * `grid` - Grid used to derive cell indices of incoming samples
    /// * `buffer_size` - Capacity of the event channel
    pub fn new(serial: &SerialConfig, grid: GridConfig, buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(buffer_size.max(1));
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: LinkState::Unopened,
                    port: None,
                    error: None,
                    generation: 0,
                    commands: None,
                    tasks: Vec::new(),
                }),
                events,
            }),
            classifier: LineClassifier::new(grid, serial.echo_raw_lines),
            baud_rate: serial.baud_rate,
            max_line_bytes: serial.max_line_bytes,
        }
    }

    /// Subscribe to the link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        let inner = self.shared.lock();
        LinkStatus {
            state: inner.state,
            port: inner.port.clone(),
            error: inner.error.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().state == LinkState::Open
    }

    /// Open the serial device at `path`.
    ///
    /// The I/O tasks of a previous connection are stopped and their transport
    /// dropped first, so the same device can be opened again. On failure the
    /// link moves to `errored` and a connection event carrying the error is
    /// emitted.
    pub async fn open(&self, path: &str) -> Result<(), LinkError> {
        self.release_tasks().await;
        info!("Opening controller port {} at {} baud", path, self.baud_rate);
        match tokio_serial::new(path, self.baud_rate).open_native_async() {
            Ok(stream) => {
                self.attach(stream, path);
                Ok(())
            }
            Err(source) => {
                error!("Failed to connect to controller on {}: {}", path, source);
                let mut inner = self.shared.lock();
                inner.generation += 1;
                inner.state = LinkState::Errored;
                inner.port = Some(path.to_string());
                inner.error = Some(source.to_string());
                inner.commands = None;
                self.shared.emit_connection(&inner);
                Err(LinkError::Open {
                    port: path.to_string(),
                    source,
                })
            }
        }
    }

    /// Open the forced port, or the one found by `resolver`.
    ///
    /// Returns the path that was opened.
    pub async fn connect(
        &self,
        resolver: &PortResolver,
        forced: Option<&str>,
    ) -> Result<String, LinkError> {
        let path = match forced {
            Some(path) => path.to_string(),
            None => resolver.resolve().ok_or(LinkError::NoPortFound)?,
        };
        self.open(&path).await?;
        Ok(path)
    }

    /// Close the current connection, if any, and connect again.
    pub async fn reconnect(
        &self,
        resolver: &PortResolver,
        forced: Option<&str>,
    ) -> Result<String, LinkError> {
        self.close().await;
        self.connect(resolver, forced).await
    }

    /// Take ownership of an already opened transport.
    ///
    /// Any previous connection is dropped first. `label` is reported as the
    /// port of the connection.
    pub fn attach<T>(&self, transport: T, label: &str)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.shared.lock();
        abort_tasks(&mut inner);
        inner.generation += 1;
        let generation = inner.generation;
        inner.state = LinkState::Open;
        inner.port = Some(label.to_string());
        inner.error = None;
        inner.commands = Some(tx);
        info!("Controller connected on {}", label);
        self.shared.emit_connection(&inner);

        let read_task = tokio::spawn(read_loop(
            reader,
            generation,
            self.shared.clone(),
            self.classifier.clone(),
            self.max_line_bytes,
        ));
        let write_task = tokio::spawn(write_loop(writer, rx, generation, self.shared.clone()));
        inner.tasks.push(read_task);
        inner.tasks.push(write_task);
    }

    /// Queue `command` for the controller, terminated by a newline.
    ///
    /// Fails with [`LinkError::NotConnected`] unless the link is open.
    pub fn send(&self, command: &str) -> Result<(), LinkError> {
        let command = command.trim_end_matches(['\r', '\n']);
        if command.is_empty() || command.contains(['\r', '\n']) {
            return Err(LinkError::InvalidCommand(command.to_string()));
        }

        let inner = self.shared.lock();
        match (&inner.state, &inner.commands) {
            (LinkState::Open, Some(tx)) => {
                debug!("Sending command to controller: {}", command);
                tx.send(command.to_string())
                    .map_err(|_| LinkError::NotConnected)
            }
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Close the connection. Returns whether a connection was open.
    ///
    /// Returns once the I/O tasks have stopped and the transport is dropped.
    pub async fn close(&self) -> bool {
        let was_open = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.commands = None;
            if inner.state == LinkState::Open {
                info!("Closing controller connection");
                inner.state = LinkState::Closed;
                inner.error = None;
                self.shared.emit_connection(&inner);
                true
            } else {
                false
            }
        };
        self.release_tasks().await;
        was_open
    }

    /// Abort the I/O tasks and wait until they are gone.
    async fn release_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.shared.lock().tasks.drain(..).collect();
        for task in tasks {
            task.abort();
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("Controller I/O task panicked: {}", err);
                }
            }
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        abort_tasks(&mut inner);
    }
}

fn abort_tasks(inner: &mut Inner) {
    for task in inner.tasks.drain(..) {
        task.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    generation: u64,
    shared: Arc<Shared>,
    classifier: LineClassifier,
    max_line_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(max_line_bytes);
    let mut buf = [0u8; 1024];

    let failure = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    for event in classifier.classify(&line, Utc::now()) {
                        let _ = shared.events.send(event);
                    }
                }
            }
            Err(err) => break Some(err.to_string()),
        }
    };

    if splitter.pending() > 0 {
        warn!(
            "Discarding {} bytes of incomplete line at end of stream",
            splitter.pending()
        );
    }
    shared.finish(generation, failure);
}

async fn write_loop<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<String>,
    generation: u64,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        let mut line = command.into_bytes();
        line.push(b'\n');
        let result = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = result {
            shared.finish(generation, Some(err.to_string()));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;
    use tokio::time::timeout;

    fn link() -> DeviceLink {
        DeviceLink::new(&SerialConfig::default(), GridConfig::default(), 64)
    }

    async fn next(rx: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("link event channel closed")
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let link = link();
        assert_eq!(link.status().state, LinkState::Unopened);
        assert!(matches!(link.send("HOME"), Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_attach_decode_and_eof() {
        let link = link();
        let mut rx = link.subscribe();
        let (mut device, transport) = tokio::io::duplex(256);

        link.attach(transport, "duplex");
        match next(&mut rx).await {
            LinkEvent::Connection(status) => {
                assert!(status.connected);
                assert_eq!(status.port.as_deref(), Some("duplex"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A line split across two writes is emitted once, complete
        device.write_all(b"{\"x\":5,\"y\":").await.unwrap();
        device.write_all(b"10,\"z\":3}\n").await.unwrap();
        match next(&mut rx).await {
            LinkEvent::Sample { sample, .. } => {
                assert_eq!((sample.grid_x, sample.grid_y), (1, 2));
                assert_eq!(sample.z, 3.0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        device.write_all(b"{\"status\":\"scanning\"}\n").await.unwrap();
        assert!(matches!(next(&mut rx).await, LinkEvent::Status(_)));

        drop(device);
        match next(&mut rx).await {
            LinkEvent::Connection(status) => assert!(!status.connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(link.status().state, LinkState::Closed);
        assert!(matches!(link.send("HOME"), Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_writes_newline_terminated_command() {
        let link = link();
        let (device, transport) = tokio::io::duplex(256);
        link.attach(transport, "duplex");

        link.send("MOVE_TO_X:5").unwrap();
        link.send("START_SCAN\n").unwrap();

        let mut lines = tokio::io::BufReader::new(device).lines();
        let first = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_deref(), Some("MOVE_TO_X:5"));
        assert_eq!(second.as_deref(), Some("START_SCAN"));
    }

    #[tokio::test]
    async fn test_embedded_newline_is_rejected() {
        let link = link();
        let (_device, transport) = tokio::io::duplex(256);
        link.attach(transport, "duplex");
        assert!(matches!(
            link.send("HOME\nSTART_SCAN"),
            Err(LinkError::InvalidCommand(_))
        ));
        assert!(matches!(link.send(""), Err(LinkError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn test_close_then_reattach() {
        let link = link();
        let mut rx = link.subscribe();
        let (_first_device, first) = tokio::io::duplex(64);
        link.attach(first, "first");
        let _ = next(&mut rx).await;

        assert!(link.close().await);
        match next(&mut rx).await {
            LinkEvent::Connection(status) => assert!(!status.connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!link.close().await);

        let (_second_device, second) = tokio::io::duplex(64);
        link.attach(second, "second");
        match next(&mut rx).await {
            LinkEvent::Connection(status) => {
                assert!(status.connected);
                assert_eq!(status.port.as_deref(), Some("second"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(link.is_open());
    }

    #[tokio::test]
    async fn test_close_releases_transport() {
        let link = link();
        let (mut device, transport) = tokio::io::duplex(64);
        link.attach(transport, "duplex");

        // Both halves of the transport are gone once close returns, so an
        // exclusively locked serial device could be opened again right away
        assert!(link.close().await);
        assert!(device.write_all(b"{\"status\":\"ready\"}\n").await.is_err());
    }

    #[tokio::test]
    async fn test_open_after_failure_releases_previous_transport() {
        let link = link();
        let (mut device, transport) = tokio::io::duplex(64);
        link.attach(transport, "duplex");

        assert!(link.open("/dev/gantry-control-does-not-exist").await.is_err());
        assert_eq!(link.status().state, LinkState::Errored);
        assert!(device.write_all(b"HOME\n").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[ignore = "needs a pseudo terminal"]
    async fn test_reconnect_reopens_same_device() {
        use crate::acquisition::port_resolver::MockPortEnumerator;
        use tokio_serial::{SerialPort, SerialStream};

        let (_master, slave) = SerialStream::pair().expect("pseudo terminal pair");
        let path = slave.name().expect("slave device path");
        drop(slave);

        let link = link();
        let resolver = PortResolver::new(Box::new(MockPortEnumerator::new()), Vec::new());
        link.open(&path).await.expect("first open");
        for _ in 0..3 {
            let reopened = link.reconnect(&resolver, Some(path.as_str())).await;
            assert_eq!(reopened.expect("reconnect on the same device"), path);
            assert!(link.is_open());
        }
        assert!(link.close().await);
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_close_new_one() {
        let link = link();
        let (first_device, first) = tokio::io::duplex(64);
        link.attach(first, "first");
        let (_second_device, second) = tokio::io::duplex(64);
        link.attach(second, "second");

        // EOF on the superseded transport must not touch the new connection
        drop(first_device);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = link.status();
        assert_eq!(status.state, LinkState::Open);
        assert_eq!(status.port.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_open_missing_device_reports_error() {
        let link = link();
        let mut rx = link.subscribe();
        let result = link.open("/dev/gantry-control-does-not-exist").await;
        assert!(matches!(result, Err(LinkError::Open { .. })));
        assert_eq!(link.status().state, LinkState::Errored);
        match next(&mut rx).await {
            LinkEvent::Connection(status) => {
                assert!(!status.connected);
                assert!(status.error.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
