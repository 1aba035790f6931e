/// Serial devices exposed as Unix ttys.
///
/// Devices are discovered under `/dev` with USB ids read from sysfs. The fd is
/// opened non-blocking, switched to raw mode at the requested speed, locked
/// exclusively and driven through `AsyncFd`. Attach/detach notifications come
/// from polling the device list.
use super::{DeviceEvent, DeviceFilter, DeviceInfo, DeviceStream, DeviceTransport, TransportError};
use async_trait::async_trait;
use fs2::FileExt;
use nix::sys::termios::{self, BaudRate, FlushArg, SetArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;

const DEV_DIR: &str = "/dev";
const SYS_CLASS_TTY: &str = "/sys/class/tty";
const NAME_PREFIXES: &[&str] = &["ttyACM", "ttyUSB", "cu.usbmodem", "cu.usbserial"];

pub struct TtyTransport {
    dev_dir: PathBuf,
    sys_dir: PathBuf,
    poll_interval: Duration,
    events: broadcast::Sender<DeviceEvent>,
    polling: Arc<AtomicBool>,
}

impl TtyTransport {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_roots(DEV_DIR, SYS_CLASS_TTY, poll_interval)
    }

    fn with_roots(
        dev_dir: impl Into<PathBuf>,
        sys_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            dev_dir: dev_dir.into(),
            sys_dir: sys_dir.into(),
            poll_interval,
            events,
            polling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Diff the device list on an interval; stops once nobody is subscribed.
    fn start_hotplug_poll(&self) {
        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let dev_dir = self.dev_dir.clone();
        let sys_dir = self.sys_dir.clone();
        let interval = self.poll_interval;
        let events = self.events.clone();
        let polling = Arc::clone(&self.polling);

        tokio::spawn(async move {
            let mut known = scan_devices(&dev_dir, &sys_dir);
            loop {
                tokio::time::sleep(interval).await;
                if events.receiver_count() == 0 {
                    break;
                }
                let current = scan_devices(&dev_dir, &sys_dir);
                for gone in known.iter().filter(|d| !current.iter().any(|c| c.path == d.path)) {
                    tracing::info!(device = %gone.path.display(), "device detached");
                    let _ = events.send(DeviceEvent::Detached(gone.clone()));
                }
                for added in current.iter().filter(|c| !known.iter().any(|d| d.path == c.path)) {
                    tracing::info!(device = %added.path.display(), "device attached");
                    let _ = events.send(DeviceEvent::Attached(added.clone()));
                }
                known = current;
            }
            polling.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl DeviceTransport for TtyTransport {
    fn name(&self) -> &str {
        "tty"
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(scan_devices(&self.dev_dir, &self.sys_dir))
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        // An explicit path may name a tty the scan does not cover (e.g. ttyS0).
        if let Some(path) = &filter.path {
            if !path.exists() {
                return Ok(None);
            }
            let sys_entry = path
                .file_name()
                .map(|name| self.sys_dir.join(name))
                .unwrap_or_else(|| self.sys_dir.clone());
            return Ok(Some(describe(path, &sys_entry)));
        }
        Ok(filter.select(&self.list_devices().await?))
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        baud_rate: u32,
    ) -> Result<DeviceStream, TransportError> {
        let speed = baud_rate_for(baud_rate)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK)
            .open(&device.path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(TransportError::Busy {
                path: device.path.clone(),
            });
        }
        configure_raw(&file, speed)?;
        tracing::debug!(device = %device.path.display(), baud_rate, "tty configured");

        let fd = Arc::new(AsyncFd::new(file)?);
        Ok(DeviceStream {
            reader: Box::new(TtyHalf { fd: Arc::clone(&fd) }),
            writer: Box::new(TtyHalf { fd }),
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        let rx = self.events.subscribe();
        self.start_hotplug_poll();
        rx
    }
}

fn baud_rate_for(baud: u32) -> Result<BaudRate, TransportError> {
    Ok(match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            return Err(TransportError::Unsupported(format!(
                "baud rate {other} (supported: 9600, 19200, 38400, 57600, 115200, 230400)"
            )))
        }
    })
}

/// Raw 8N1 with no echo or line discipline; stale input is discarded.
fn configure_raw(file: &File, speed: BaudRate) -> io::Result<()> {
    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, speed)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;
    termios::tcflush(file, FlushArg::TCIFLUSH)?;
    Ok(())
}

/// One direction of a shared non-blocking tty fd.
struct TtyHalf {
    fd: Arc<AsyncFd<File>>,
}

impl AsyncRead for TtyHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TtyHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Enumerate serial ttys under `dev_dir`, enriched from `sys_dir` when present.
fn scan_devices(dev_dir: &Path, sys_dir: &Path) -> Vec<DeviceInfo> {
    let entries = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dev_dir.display(), error = %e, "cannot list devices");
            return Vec::new();
        }
    };

    let mut devices: Vec<DeviceInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            NAME_PREFIXES
                .iter()
                .any(|p| name.starts_with(p))
                .then(|| describe(&entry.path(), &sys_dir.join(&name)))
        })
        .collect();
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Walk up from the tty's sysfs `device` link to the USB device carrying the ids.
fn describe(path: &Path, sys_entry: &Path) -> DeviceInfo {
    let mut info = DeviceInfo::new(path);
    let Ok(mut dir) = std::fs::canonicalize(sys_entry.join("device")) else {
        return info;
    };
    for _ in 0..4 {
        if let Some(vid) = read_hex(&dir.join("idVendor")) {
            info.vendor_id = Some(vid);
            info.product_id = read_hex(&dir.join("idProduct"));
            info.description = std::fs::read_to_string(dir.join("product"))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            break;
        }
        if !dir.pop() {
            break;
        }
    }
    info
}

fn read_hex(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}
