/// Local export of completed sessions.
///
/// Each non-empty session is written twice: the raw samples with timestamps,
/// and an Edge Impulse data-acquisition document ready for ingestion. Files
/// are written to a temp file in the target directory and renamed into place.
use crate::config::ExportConfig;
use crate::sample::{CollectionComplete, SampleValue};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// All-zero signature for unsigned (`alg: none`) documents.
const UNSIGNED: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Serialize)]
pub struct AcquisitionDocument {
    pub protected: Protected,
    pub signature: String,
    pub payload: Payload,
}

#[derive(Debug, Serialize)]
pub struct Protected {
    pub ver: &'static str,
    pub alg: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Payload {
    pub device_name: String,
    pub device_type: String,
    pub interval_ms: f64,
    pub sensors: Vec<Sensor>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sensor {
    pub name: String,
    pub units: String,
}

#[derive(Debug)]
pub enum DatasetError {
    Empty,
    /// Sample at `index` has a different shape than the first one.
    MixedShapes { index: usize },
    Serialize { source: serde_json::Error },
    Write { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for DatasetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetError::Empty => write!(f, "no samples to export"),
            DatasetError::MixedShapes { index } => {
                write!(f, "sample {index} does not match the shape of the first sample")
            }
            DatasetError::Serialize { source } => write!(f, "failed to serialize dataset: {source}"),
            DatasetError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatasetError::Serialize { source } => Some(source),
            DatasetError::Write { source, .. } => Some(source),
            DatasetError::Empty | DatasetError::MixedShapes { .. } => None,
        }
    }
}

/// Build the acquisition document for a session.
///
/// Scalars map to one sensor named by the export config; structured samples
/// map one sensor per channel. Every sample must share the first one's shape.
pub fn acquisition_document(
    event: &CollectionComplete,
    export: &ExportConfig,
) -> Result<AcquisitionDocument, DatasetError> {
    let first = event.samples.first().ok_or(DatasetError::Empty)?;
    let names = first.value.channel_names();
    for (index, sample) in event.samples.iter().enumerate() {
        if sample.value.channel_names() != names {
            return Err(DatasetError::MixedShapes { index });
        }
    }

    let sensors = match &first.value {
        SampleValue::Scalar(_) => vec![Sensor {
            name: export.sensor_name.clone(),
            units: export.sensor_units.clone(),
        }],
        SampleValue::Structured(channels) => channels
            .iter()
            .map(|c| Sensor {
                name: c.name.clone(),
                units: export.sensor_units.clone(),
            })
            .collect(),
    };

    Ok(AcquisitionDocument {
        protected: Protected {
            ver: "v1",
            alg: "none",
        },
        signature: UNSIGNED.to_string(),
        payload: Payload {
            device_name: export.device_name.clone(),
            device_type: export.device_type.clone(),
            interval_ms: 1000.0 / f64::from(event.sample_rate_hz.max(1)),
            sensors,
            values: event.samples.iter().map(|s| s.value.values()).collect(),
        },
    })
}

/// Paths produced for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub samples: PathBuf,
    /// `None` when the samples could not form an acquisition document.
    pub acquisition: Option<PathBuf>,
}

pub struct DatasetWriter {
    dir: PathBuf,
    export: ExportConfig,
}

impl DatasetWriter {
    pub fn new(dir: impl Into<PathBuf>, export: ExportConfig) -> Self {
        Self {
            dir: dir.into(),
            export,
        }
    }

    /// Write both files for `event`, named `{label}_{epoch_ms}`.
    pub fn write(&self, event: &CollectionComplete) -> Result<Written, DatasetError> {
        if event.samples.is_empty() {
            return Err(DatasetError::Empty);
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| DatasetError::Write {
            path: self.dir.clone(),
            source: e,
        })?;

        let stem = format!(
            "{}_{}",
            sanitize(&event.label),
            event.completion_time.timestamp_millis()
        );

        let samples = self.dir.join(format!("{stem}.samples.json"));
        write_json(&samples, event)?;

        let acquisition = match acquisition_document(event, &self.export) {
            Ok(doc) => {
                let path = self.dir.join(format!("{stem}.json"));
                write_json(&path, &doc)?;
                Some(path)
            }
            Err(DatasetError::MixedShapes { index }) => {
                tracing::warn!(
                    label = %event.label,
                    index,
                    "samples change shape mid-session, skipping acquisition document"
                );
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Written {
            samples,
            acquisition,
        })
    }
}

/// Keep labels usable as file names.
fn sanitize(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DatasetError> {
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| DatasetError::Serialize { source: e })?;
    let io_err = |source: std::io::Error| DatasetError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
