/// Connection lifecycle for one serial device at a time.
///
/// `ConnectionManager` owns the open stream and a background read loop that
/// decodes chunks and hands them to the registered `ChunkConsumer`. State
/// changes are published on a `watch` channel so sessions and the CLI can
/// follow the link.
use crate::config::DeviceConfig;
use crate::decode::Utf8Decoder;
use crate::monitor::Monitor;
use crate::retry::{ReadFailure, ReadRetryPolicy, RetryDecision};
use crate::transport::{
    BoxedReader, BoxedWriter, DeviceEvent, DeviceFilter, DeviceInfo, DeviceStream,
    DeviceTransport,
};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Receives every decoded chunk in read order, on the read loop's task.
pub trait ChunkConsumer: Send + Sync {
    fn on_chunk(&self, text: &str);
}

#[derive(Debug)]
pub enum ConnectionError {
    /// Nothing was selected, or the device could not be opened.
    DeviceUnavailable { reason: String },
    NotConnected,
    /// A connect is already in flight or a link is open.
    Busy { state: ConnectionState },
    Write { source: std::io::Error },
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::DeviceUnavailable { reason } => {
                write!(f, "device unavailable: {reason}")
            }
            ConnectionError::NotConnected => write!(f, "no active connection"),
            ConnectionError::Busy { state } => {
                write!(f, "connection busy (currently {state})")
            }
            ConnectionError::Write { source } => write!(f, "write failed: {source}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Write { source } => Some(source),
            _ => None,
        }
    }
}

struct Link {
    id: u64,
    device: DeviceInfo,
    reader: Arc<Mutex<BoxedReader>>,
    writer: Arc<Mutex<BoxedWriter>>,
    stop: CancellationToken,
    read_task: Option<JoinHandle<()>>,
}

/// Guarded by one lock together with the state transitions.
struct Slot {
    link: Option<Link>,
    /// Bumped by every connect attempt and by cancelling one.
    epoch: u64,
}

struct Inner {
    transport: Arc<dyn DeviceTransport>,
    config: DeviceConfig,
    monitor: Monitor,
    state: watch::Sender<ConnectionState>,
    slot: StdMutex<Slot>,
    consumer: StdMutex<Option<Arc<dyn ChunkConsumer>>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        config: DeviceConfig,
        monitor: Monitor,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                monitor,
                state,
                slot: StdMutex::new(Slot {
                    link: None,
                    epoch: 0,
                }),
                consumer: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn set_consumer(&self, consumer: Arc<dyn ChunkConsumer>) {
        *lock(&self.inner.consumer) = Some(consumer);
    }

    #[cfg(test)]
    pub fn current_device(&self) -> Option<DeviceInfo> {
        lock(&self.inner.slot).link.as_ref().map(|l| l.device.clone())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ConnectionError> {
        self.inner
            .transport
            .list_devices()
            .await
            .map_err(|e| ConnectionError::DeviceUnavailable {
                reason: e.to_string(),
            })
    }

    /// Select, open and start reading a device.
    pub async fn connect(&self, filter: &DeviceFilter) -> Result<DeviceInfo, ConnectionError> {
        let epoch = {
            let mut slot = lock(&self.inner.slot);
            let current = self.state();
            if current != ConnectionState::Disconnected {
                return Err(ConnectionError::Busy { state: current });
            }
            slot.epoch += 1;
            self.inner.state.send_replace(ConnectionState::Connecting);
            slot.epoch
        };

        let opened = self.open(filter).await;

        let (device, reader, stop) = {
            let mut slot = lock(&self.inner.slot);
            if slot.epoch != epoch || self.state() != ConnectionState::Connecting {
                return Err(ConnectionError::DeviceUnavailable {
                    reason: "connection attempt cancelled".to_string(),
                });
            }
            let (device, stream) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    self.inner.state.send_replace(ConnectionState::Disconnected);
                    drop(slot);
                    self.inner.monitor.status(format!("Error: {e}"));
                    return Err(e);
                }
            };

            let reader = Arc::new(Mutex::new(stream.reader));
            let stop = CancellationToken::new();
            slot.link = Some(Link {
                id: epoch,
                device: device.clone(),
                reader: Arc::clone(&reader),
                writer: Arc::new(Mutex::new(stream.writer)),
                stop: stop.clone(),
                read_task: None,
            });
            self.inner.state.send_replace(ConnectionState::Connected);
            (device, reader, stop)
        };

        info!(device = %device.path.display(), baud_rate = self.inner.config.baud_rate, "connected");
        self.inner.monitor.status("Connection established");

        let task = tokio::spawn(self.clone().read_loop(epoch, reader, stop));
        if let Some(link) = lock(&self.inner.slot).link.as_mut().filter(|l| l.id == epoch) {
            link.read_task = Some(task);
        }
        Ok(device)
    }

    async fn open(
        &self,
        filter: &DeviceFilter,
    ) -> Result<(DeviceInfo, DeviceStream), ConnectionError> {
        let unavailable = |reason: String| ConnectionError::DeviceUnavailable { reason };
        let device = self
            .inner
            .transport
            .request_device(filter)
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .ok_or_else(|| unavailable("no device selected".to_string()))?;

        self.inner.monitor.status("Device selected. Opening connection...");
        let stream = self
            .inner
            .transport
            .open(&device, self.inner.config.baud_rate)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok((device, stream))
    }

    /// Stop reading, close the stream and end in `Disconnected`.
    ///
    /// Safe to call in any state; a connect still in flight is cancelled.
    pub async fn disconnect(&self) {
        self.teardown(None).await;
    }

    /// Shared teardown. `from_loop` carries the link id when the read loop
    /// itself gave up, so a stale loop cannot close a newer link.
    async fn teardown(&self, from_loop: Option<u64>) {
        let link = {
            let mut slot = lock(&self.inner.slot);
            match self.state() {
                ConnectionState::Disconnected => return,
                ConnectionState::Connecting => {
                    if from_loop.is_none() {
                        slot.epoch += 1;
                        self.inner.state.send_replace(ConnectionState::Disconnected);
                    }
                    return;
                }
                ConnectionState::Disconnecting => None,
                ConnectionState::Connected => {
                    if let Some(id) = from_loop {
                        if slot.link.as_ref().map(|l| l.id) != Some(id) {
                            return;
                        }
                    }
                    self.inner.state.send_replace(ConnectionState::Disconnecting);
                    slot.link.take()
                }
            }
        };

        let Some(link) = link else {
            // Another caller is tearing down; the loop must not wait on itself.
            if from_loop.is_none() {
                self.wait_until_disconnected().await;
            }
            return;
        };

        self.close_link(link, from_loop.is_some()).await;

        {
            let _slot = lock(&self.inner.slot);
            if self.state() == ConnectionState::Disconnecting {
                self.inner.state.send_replace(ConnectionState::Disconnected);
            }
        }
        info!("disconnected");
        self.inner.monitor.status("Disconnected from device");
    }

    async fn close_link(&self, link: Link, from_loop: bool) {
        let grace = Duration::from_millis(self.inner.config.disconnect_grace_ms);
        link.stop.cancel();

        if let Some(mut task) = link.read_task {
            if !from_loop && tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("read loop did not stop within grace period, aborting");
                task.abort();
            }
        }

        let close = async {
            let mut writer = link.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(grace, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "error closing device stream");
                self.inner.monitor.status(format!("Disconnect error: {e}"));
            }
            Err(_) => warn!("device stream did not close within grace period, dropping it"),
        }
    }

    async fn wait_until_disconnected(&self) {
        let mut rx = self.subscribe();
        let grace = Duration::from_millis(self.inner.config.disconnect_grace_ms);
        let wait = rx.wait_for(|s| *s == ConnectionState::Disconnected);
        if tokio::time::timeout(grace * 4, wait).await.is_err() {
            warn!("timed out waiting for concurrent disconnect, forcing disconnected");
            let _slot = lock(&self.inner.slot);
            if self.state() == ConnectionState::Disconnecting {
                self.inner.state.send_replace(ConnectionState::Disconnected);
            }
        }
    }

    /// The device went away: drop the link without waiting for the read loop.
    async fn device_removed(&self, device: &DeviceInfo) {
        let link = {
            let mut slot = lock(&self.inner.slot);
            if slot.link.as_ref().map(|l| &l.device.path) != Some(&device.path) {
                return;
            }
            let link = slot.link.take();
            self.inner.state.send_replace(ConnectionState::Disconnected);
            link
        };
        if let Some(link) = link {
            link.stop.cancel();
            if let Some(task) = link.read_task {
                task.abort();
            }
            info!(device = %device.path.display(), "device removed, link dropped");
            self.inner.monitor.status("Disconnected from device");
        }
    }

    /// Follow attach/detach notifications until the transport goes away.
    pub fn watch_device_events(&self) -> JoinHandle<()> {
        let mut events = self.inner.transport.subscribe_events();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Attached(device)) => {
                        debug!(device = %device.path.display(), "attach event");
                        manager.inner.monitor.status("Device connected");
                    }
                    Ok(DeviceEvent::Detached(device)) => {
                        debug!(device = %device.path.display(), "detach event");
                        manager.inner.monitor.status("Device disconnected");
                        manager.device_removed(&device).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "device events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Write bytes to the device, optionally followed by a newline.
    ///
    /// A failed write is reported but leaves the link up.
    pub async fn send(&self, bytes: &[u8], append_newline: bool) -> Result<(), ConnectionError> {
        let writer = {
            let slot = lock(&self.inner.slot);
            match (&slot.link, self.state()) {
                (Some(link), ConnectionState::Connected) => Arc::clone(&link.writer),
                _ => {
                    drop(slot);
                    self.inner.monitor.status("Error: no active connection");
                    return Err(ConnectionError::NotConnected);
                }
            }
        };

        let mut payload = bytes.to_vec();
        if append_newline {
            payload.push(b'\n');
        }

        let result = {
            let mut handle = writer.lock().await;
            match handle.write_all(&payload).await {
                Ok(()) => handle.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                debug!(bytes = payload.len(), "sent");
                self.inner
                    .monitor
                    .status(format!("Sent: {}", String::from_utf8_lossy(&payload).trim_end()));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                self.inner.monitor.status(format!("Send error: {e}"));
                Err(ConnectionError::Write { source: e })
            }
        }
    }

    fn deliver(&self, text: &str) {
        let consumer = lock(&self.inner.consumer).clone();
        if let Some(consumer) = consumer {
            consumer.on_chunk(text);
        }
    }

    async fn read_loop(self, id: u64, reader: Arc<Mutex<BoxedReader>>, stop: CancellationToken) {
        let config = &self.inner.config;
        let delay = Duration::from_millis(config.reconnect_delay_ms);
        let mut policy = ReadRetryPolicy::new(config.max_read_retries);
        let mut decoder = Utf8Decoder::new();
        let mut buf = vec![0u8; config.read_chunk_bytes.max(1)];

        'session: loop {
            let failure = {
                let mut handle = tokio::select! {
                    _ = stop.cancelled() => break 'session,
                    handle = reader.lock() => handle,
                };
                loop {
                    let read = tokio::select! {
                        _ = stop.cancelled() => break 'session,
                        read = handle.read(&mut buf) => read,
                    };
                    match read {
                        Ok(0) => break ReadFailure::EndOfStream,
                        Ok(n) => {
                            policy.record_success();
                            let text = decoder.decode(&buf[..n]);
                            if !text.is_empty() {
                                self.deliver(&text);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "read error");
                            self.inner.monitor.status(format!("Read error: {e}"));
                            break ReadFailure::classify(&e);
                        }
                    }
                }
            };

            match policy.evaluate(failure) {
                RetryDecision::Retry { .. } => {
                    tokio::select! {
                        _ = stop.cancelled() => break 'session,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => break,
            }
        }

        if decoder.finish().is_some() {
            debug!("dropped incomplete character at end of stream");
        }
        if stop.is_cancelled() {
            debug!("read loop stopped");
        } else {
            self.teardown(Some(id)).await;
        }
    }
}
