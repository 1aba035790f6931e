pub mod simulated;
#[cfg(all(unix, feature = "tty"))]
pub mod tty;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// One selectable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub description: Option<String>,
}

impl DeviceInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            description: None,
        }
    }

    /// `path [vid:pid] description`, omitting unknown parts.
    pub fn label(&self) -> String {
        let mut out = self.path.display().to_string();
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            out.push_str(&format!(" [{vid:04x}:{pid:04x}]"));
        } else if let Some(vid) = self.vendor_id {
            out.push_str(&format!(" [{vid:04x}]"));
        }
        if let Some(desc) = &self.description {
            out.push(' ');
            out.push_str(desc);
        }
        out
    }
}

/// Device selection criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Exact device path; wins over `vendor_id` when set.
    pub path: Option<PathBuf>,
    pub vendor_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if let Some(path) = &self.path {
            return &device.path == path;
        }
        match self.vendor_id {
            Some(vid) => device.vendor_id == Some(vid),
            None => true,
        }
    }

    /// Pick the first matching device.
    pub fn select(&self, devices: &[DeviceInfo]) -> Option<DeviceInfo> {
        devices.iter().find(|d| self.matches(d)).cloned()
    }
}

/// Attach/detach notifications from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceInfo),
    Detached(DeviceInfo),
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open duplex stream, split into its read and write halves.
///
/// Dropping both halves closes the device.
pub struct DeviceStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Errors produced by transport operations.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    /// Another process holds the device.
    Busy { path: PathBuf },
    Unsupported(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Busy { path } => {
                write!(f, "device {} is in use by another process", path.display())
            }
            TransportError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Busy { .. } | TransportError::Unsupported(_) => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Environment access to serial-like duplex byte devices.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Human-readable transport name (e.g., "tty", "simulated").
    fn name(&self) -> &str;

    /// Devices currently visible to the transport.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Choose a device. `Ok(None)` means nothing was selected.
    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        let devices = self.list_devices().await?;
        Ok(filter.select(&devices))
    }

    /// Open `device` at a fixed bit rate.
    async fn open(&self, device: &DeviceInfo, baud_rate: u32)
        -> Result<DeviceStream, TransportError>;

    /// Subscribe to attach/detach notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent>;
}
