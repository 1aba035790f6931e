use std::path::{Path, PathBuf};

/// Manages the `.serial-capture/` directory layout.
///
/// Config, the status file and exported datasets all live under one data
/// directory (default `.serial-capture/`).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the config file (e.g. `.serial-capture/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Path to the capture status file.
    pub fn status(&self) -> PathBuf {
        self.root.join("capture.status")
    }

    /// Directory receiving exported sessions.
    pub fn datasets_dir(&self) -> PathBuf {
        self.root.join("datasets")
    }

    /// Default content written to `config.toml` when initializing a new data directory.
    const DEFAULT_CONFIG: &str = "\
# serial-capture configuration
# Every key is optional; missing keys use built-in defaults.

[device]
# path = \"/dev/ttyACM0\"
vendor_id = 0x2886
baud_rate = 115200

[session]
label = \"\"
duration_ms = 5000
sample_rate_hz = 100

[export]
device_type = \"XIAO_TOUCH_SENSOR\"
";

    /// Create root and datasets/, writing a default config.toml if missing.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.datasets_dir())?;

        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }

        Ok(created)
    }
}
