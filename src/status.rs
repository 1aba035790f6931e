/// Status file: writes `capture.status` as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Process states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Starting,
    Connecting,
    Connected,
    Collecting,
    Exporting,
    Disconnected,
    ShuttingDown,
}

/// The JSON payload written to `capture.status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: CaptureState,
    pub device: Option<String>,
    pub label: Option<String>,
    pub session: u32,
    pub max_sessions: u32,
    pub session_start: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub last_sample_count: Option<usize>,
    pub last_dataset: Option<String>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".capture.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    max_sessions: u32,
    session: u32,
    device: Option<String>,
    label: Option<String>,
    session_start: Option<DateTime<Utc>>,
    last_sample_count: Option<usize>,
    last_dataset: Option<String>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, max_sessions: u32) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            max_sessions,
            session: 0,
            device: None,
            label: None,
            session_start: None,
            last_sample_count: None,
            last_dataset: None,
        }
    }

    /// Write the status file with the given state. Failures are logged only.
    pub fn update(&self, state: CaptureState) {
        let data = StatusData {
            pid: self.pid,
            state,
            device: self.device.clone(),
            label: self.label.clone(),
            session: self.session,
            max_sessions: self.max_sessions,
            session_start: self.session_start,
            last_update: Utc::now(),
            last_sample_count: self.last_sample_count,
            last_dataset: self.last_dataset.clone(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_device(&mut self, device: Option<String>) {
        self.device = device;
    }

    /// Mark the start of session number `session` (1-based).
    pub fn begin_session(&mut self, session: u32, label: &str) {
        self.session = session;
        self.label = Some(label.to_string());
        self.session_start = Some(Utc::now());
    }

    pub fn set_last_result(&mut self, sample_count: usize, dataset: Option<&Path>) {
        self.last_sample_count = Some(sample_count);
        self.last_dataset = dataset.map(|p| p.display().to_string());
    }

    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_tracker_writes_state_and_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.status");
        let mut tracker = StatusTracker::new(path.clone(), 3);

        tracker.update(CaptureState::Starting);
        assert_eq!(read(&path)["state"], "starting");

        tracker.set_device(Some("/dev/ttyACM0".to_string()));
        tracker.begin_session(2, "tap");
        tracker.update(CaptureState::Collecting);

        let json = read(&path);
        assert_eq!(json["state"], "collecting");
        assert_eq!(json["device"], "/dev/ttyACM0");
        assert_eq!(json["label"], "tap");
        assert_eq!(json["session"], 2);
        assert_eq!(json["max_sessions"], 3);
        assert!(json["session_start"].is_string());
    }

    #[test]
    fn test_last_result_recorded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.status");
        let mut tracker = StatusTracker::new(path.clone(), 1);
        tracker.set_last_result(42, Some(Path::new("datasets/tap_1.json")));
        tracker.update(CaptureState::Exporting);

        let json = read(&path);
        assert_eq!(json["last_sample_count"], 42);
        assert_eq!(json["last_dataset"], "datasets/tap_1.json");
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.status");
        StatusTracker::new(path.clone(), 1).update(CaptureState::Connected);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["capture.status"]);
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.status");
        let tracker = StatusTracker::new(path.clone(), 1);
        tracker.update(CaptureState::ShuttingDown);
        assert!(path.exists());
        tracker.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_write_to_missing_dir_fails() {
        let dir = tempdir().unwrap();
        let sf = StatusFile::new(dir.path().join("missing/capture.status"));
        let data = StatusData {
            pid: 1,
            state: CaptureState::Starting,
            device: None,
            label: None,
            session: 0,
            max_sessions: 1,
            session_start: None,
            last_update: Utc::now(),
            last_sample_count: None,
            last_dataset: None,
        };
        assert!(matches!(sf.write(&data), Err(StatusError::Write { .. })));
    }
}
