use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Shortest collection run accepted by `start`, in milliseconds.
pub const MIN_DURATION_MS: u64 = 1_000;
/// Longest collection run accepted by `start`, in milliseconds.
pub const MAX_DURATION_MS: u64 = 30_000;
/// Lowest target sample rate accepted by `start`, in Hz.
pub const MIN_SAMPLE_RATE_HZ: u32 = 10;
/// Highest target sample rate accepted by `start`, in Hz.
pub const MAX_SAMPLE_RATE_HZ: u32 = 1_000;
/// Fields a delimited line must carry: one timestamp plus eight data channels.
pub const EXPECTED_CHANNELS: usize = 9;

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: DeviceConfig,
    pub session: SessionConfig,
    pub extractor: ExtractorConfig,
    pub export: ExportConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Explicit device path; when unset the first device matching `vendor_id` is chosen.
    pub path: Option<PathBuf>,
    /// USB vendor id filter (Seeed Studio by default).
    pub vendor_id: Option<u16>,
    pub baud_rate: u32,
    /// Pause between read-handle re-acquisitions after a failed read.
    pub reconnect_delay_ms: u64,
    /// How long `disconnect` waits for the read loop before closing the stream.
    pub disconnect_grace_ms: u64,
    /// Consecutive failed reads tolerated before the read loop gives up.
    pub max_read_retries: u32,
    /// Interval of the device-list poll used for attach/detach notifications.
    pub hotplug_poll_ms: u64,
    pub read_chunk_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub label: String,
    pub duration_ms: u64,
    pub sample_rate_hz: u32,
    pub progress_every: usize,
    /// Number of back-to-back sessions a single run captures.
    pub sessions: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub separator: String,
    pub channel_names: Vec<String>,
    pub header_tokens: Vec<String>,
    pub json_keys: Vec<String>,
    pub reassemble_lines: bool,
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportConfig {
    pub device_name: String,
    pub device_type: String,
    /// Sensor name used when samples are scalars.
    pub sensor_name: String,
    pub sensor_units: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

// --- Default implementations ---

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: None,
            vendor_id: Some(0x2886),
            baud_rate: 115_200,
            reconnect_delay_ms: 100,
            disconnect_grace_ms: 100,
            max_read_retries: 5,
            hotplug_poll_ms: 1_000,
            read_chunk_bytes: 1_024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            duration_ms: 5_000,
            sample_rate_hz: 100,
            progress_every: 50,
            sessions: 1,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        let mut channel_names = vec!["timestamp".to_string()];
        channel_names.extend((1..EXPECTED_CHANNELS).map(|i| format!("ch{i}")));
        Self {
            separator: ",".to_string(),
            channel_names,
            header_tokens: vec!["timestamp".to_string(), "time".to_string()],
            json_keys: ["value", "sensor", "touch", "reading", "data"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            reassemble_lines: true,
            max_line_bytes: 4_096,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            device_name: "SerialCapture-TouchSensor".to_string(),
            device_type: "XIAO_TOUCH_SENSOR".to_string(),
            sensor_name: "touch_sensor".to_string(),
            sensor_units: "raw".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".serial-capture"),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Load configuration from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<CaptureConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(CaptureConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl CaptureConfig {
    /// Check values that would otherwise only fail deep inside a capture.
    ///
    /// Session label/duration/rate are not checked here: `start` validates them
    /// and reports the precise rejection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.baud_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "device.baud_rate",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.device.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "device.read_chunk_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.extractor.separator.is_empty() {
            return Err(ConfigError::Invalid {
                field: "extractor.separator",
                reason: "must not be empty".to_string(),
            });
        }
        if self.extractor.channel_names.len() != EXPECTED_CHANNELS {
            return Err(ConfigError::Invalid {
                field: "extractor.channel_names",
                reason: format!(
                    "expected {EXPECTED_CHANNELS} names, got {}",
                    self.extractor.channel_names.len()
                ),
            });
        }
        if self.session.sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "session.sessions",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_fixed_bounds() {
        let config = CaptureConfig::default();
        assert_eq!(config.device.baud_rate, 115_200);
        assert_eq!(config.device.vendor_id, Some(0x2886));
        assert_eq!(config.extractor.channel_names.len(), EXPECTED_CHANNELS);
        assert_eq!(config.extractor.channel_names[0], "timestamp");
        assert_eq!(config.extractor.channel_names[8], "ch8");
        assert_eq!(config.session.progress_every, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.session.duration_ms, 5_000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[device]\npath = \"/dev/ttyACM0\"\nbaud_rate = 9600\n\n[session]\nlabel = \"tap\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.device.path, Some(PathBuf::from("/dev/ttyACM0")));
        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.device.reconnect_delay_ms, 100);
        assert_eq!(config.session.label, "tap");
        assert_eq!(config.session.sample_rate_hz, 100);
        assert_eq!(config.extractor.separator, ",");
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device\nbaud_rate = ").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_validate_rejects_wrong_channel_count() {
        let mut config = CaptureConfig::default();
        config.extractor.channel_names.pop();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("extractor.channel_names"));
    }

    #[test]
    fn test_validate_rejects_empty_separator() {
        let mut config = CaptureConfig::default();
        config.extractor.separator.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "extractor.separator",
                ..
            })
        ));
    }
}
