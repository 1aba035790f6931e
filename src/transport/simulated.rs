/// In-process device for demos and tests.
///
/// A generator task feeds the read half through a channel, so a script can
/// interleave data, pauses, read errors and end-of-stream. Bytes written to the
/// device are kept in a shared log.
use super::{DeviceEvent, DeviceFilter, DeviceInfo, DeviceStream, DeviceTransport, TransportError};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{broadcast, mpsc};

/// Built-in output formats for `--simulate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SimPattern {
    /// One bare number per line.
    Scalar,
    /// `{"value": n}` per line.
    Json,
    /// A timestamp plus eight comma-separated channels per line.
    Delimited,
}

impl SimPattern {
    /// Render the `n`th line of the pattern.
    pub fn line(self, n: u64, rate_hz: u32) -> String {
        let t = n as f64 / rate_hz.max(1) as f64;
        let wave = |phase: f64| (t * std::f64::consts::TAU + phase).sin() * 100.0 + 500.0;
        match self {
            SimPattern::Scalar => format!("{:.2}\n", wave(0.0)),
            SimPattern::Json => format!("{{\"value\": {:.2}}}\n", wave(0.0)),
            SimPattern::Delimited => {
                let mut fields = vec![format!("{}", (t * 1000.0) as u64)];
                fields.extend((0..8).map(|ch| format!("{:.2}", wave(ch as f64 * 0.5))));
                format!("{}\n", fields.join(","))
            }
        }
    }
}

/// One step of a scripted device.
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(Vec<u8>),
    Delay(Duration),
    /// Fail the next read with this error kind.
    Error(io::ErrorKind),
    /// Keep the stream open with no more data until the reader goes away.
    Hold,
}

#[cfg(test)]
impl ScriptStep {
    pub fn text(text: &str) -> Self {
        ScriptStep::Chunk(text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone)]
enum Source {
    Pattern { pattern: SimPattern, rate_hz: u32 },
    #[cfg(test)]
    Script(Vec<ScriptStep>),
}

pub struct SimulatedTransport {
    device: DeviceInfo,
    source: Source,
    present: Mutex<bool>,
    fail_open: bool,
    open_delay: Duration,
    fail_writes: bool,
    stall_close: bool,
    events: broadcast::Sender<DeviceEvent>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl SimulatedTransport {
    fn with_source(source: Source) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            device: DeviceInfo {
                path: "sim://touch-sensor".into(),
                vendor_id: Some(0x2886),
                product_id: Some(0x802f),
                description: Some("simulated sensor".to_string()),
            },
            source,
            present: Mutex::new(true),
            fail_open: false,
            open_delay: Duration::ZERO,
            fail_writes: false,
            stall_close: false,
            events,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A device emitting `pattern` lines at `rate_hz` forever.
    pub fn pattern(pattern: SimPattern, rate_hz: u32) -> Self {
        Self::with_source(Source::Pattern { pattern, rate_hz })
    }

    fn is_present(&self) -> bool {
        match self.present.lock() {
            Ok(present) => *present,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Fault injection and inspection for tests.
#[cfg(test)]
impl SimulatedTransport {
    /// A device replaying `steps` on each open, then reporting end-of-stream.
    pub fn scripted(steps: Vec<ScriptStep>) -> Self {
        Self::with_source(Source::Script(steps))
    }

    /// Report no devices at all.
    pub fn absent(mut self) -> Self {
        self.present = Mutex::new(false);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Take `delay` to open, leaving the manager in `Connecting` meanwhile.
    pub fn slow_open(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Never finish closing the write half.
    pub fn stalling_close(mut self) -> Self {
        self.stall_close = true;
        self
    }

    /// Everything written to the device so far.
    pub fn sent(&self) -> Vec<u8> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_present(&self, value: bool) {
        match self.present.lock() {
            Ok(mut present) => *present = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Simulate unplugging the device.
    pub fn detach(&self) {
        self.set_present(false);
        let _ = self.events.send(DeviceEvent::Detached(self.device.clone()));
    }

    /// Simulate plugging the device back in.
    pub fn attach(&self) {
        self.set_present(true);
        let _ = self.events.send(DeviceEvent::Attached(self.device.clone()));
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        if self.is_present() {
            Ok(vec![self.device.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        // Path filters name real ttys; only the vendor filter applies here.
        let filter = DeviceFilter {
            path: None,
            vendor_id: filter.vendor_id,
        };
        Ok(filter.select(&self.list_devices().await?))
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        baud_rate: u32,
    ) -> Result<DeviceStream, TransportError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.fail_open || !self.is_present() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} cannot be opened", device.path.display()),
            )));
        }
        tracing::debug!(device = %device.path.display(), baud_rate, "opening simulated device");

        let (tx, rx) = mpsc::channel(64);
        let source = self.source.clone();
        tokio::spawn(async move {
            match source {
                Source::Pattern { pattern, rate_hz } => emit_pattern(tx, pattern, rate_hz).await,
                #[cfg(test)]
                Source::Script(steps) => replay(tx, steps).await,
            }
        });

        Ok(DeviceStream {
            reader: Box::new(ChannelReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(LogWriter {
                sent: Arc::clone(&self.sent),
                fail: self.fail_writes,
                stall_close: self.stall_close,
            }),
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

type Feed = mpsc::Sender<io::Result<Vec<u8>>>;

async fn emit_pattern(tx: Feed, pattern: SimPattern, rate_hz: u32) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    for n in 0u64.. {
        ticker.tick().await;
        if tx.send(Ok(pattern.line(n, rate_hz).into_bytes())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
async fn replay(tx: Feed, steps: Vec<ScriptStep>) {
    for step in steps {
        let sent = match step {
            ScriptStep::Chunk(bytes) => tx.send(Ok(bytes)).await,
            ScriptStep::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            ScriptStep::Error(kind) => {
                tx.send(Err(io::Error::new(kind, "simulated read failure")))
                    .await
            }
            ScriptStep::Hold => {
                tx.closed().await;
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(bytes)) => this.pending = bytes,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // Generator finished: end-of-stream.
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.drain(..n);
        Poll::Ready(Ok(()))
    }
}

struct LogWriter {
    sent: Arc<Mutex<Vec<u8>>>,
    fail: bool,
    stall_close: bool,
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.stall_close {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }
}
