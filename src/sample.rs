/// Captured observations and the completion event handed to the uploader.
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// One named numeric channel of a structured record.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub value: f64,
}

impl Channel {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The shape-tagged value of a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Scalar(f64),
    /// Channels in the order the producer emitted them.
    Structured(Vec<Channel>),
}

/// Why a raw value could not become a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSample {
    pub reason: String,
}

impl SampleValue {
    /// Normalize an untyped reading.
    ///
    /// A finite number becomes a scalar, an object whose fields are all numeric
    /// becomes a structured record with field order preserved. Anything else
    /// is rejected.
    pub fn from_raw(raw: &Value) -> Result<Self, RejectedSample> {
        match raw {
            Value::Number(n) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .map(SampleValue::Scalar)
                .ok_or_else(|| RejectedSample {
                    reason: format!("number {n} is not representable as f64"),
                }),
            Value::Object(map) => {
                if map.is_empty() {
                    return Err(RejectedSample {
                        reason: "structured value has no fields".to_string(),
                    });
                }
                let mut channels = Vec::with_capacity(map.len());
                for (name, field) in map {
                    let Some(value) = field.as_f64() else {
                        return Err(RejectedSample {
                            reason: format!("field '{name}' is not numeric: {field}"),
                        });
                    };
                    channels.push(Channel::new(name.clone(), value));
                }
                Ok(SampleValue::Structured(channels))
            }
            other => Err(RejectedSample {
                reason: format!("unsupported sample shape: {other}"),
            }),
        }
    }

    /// Channel names for structured values, `None` for scalars.
    pub fn channel_names(&self) -> Option<Vec<&str>> {
        match self {
            SampleValue::Scalar(_) => None,
            SampleValue::Structured(channels) => {
                Some(channels.iter().map(|c| c.name.as_str()).collect())
            }
        }
    }

    /// Numeric values in channel order (a single value for scalars).
    pub fn values(&self) -> Vec<f64> {
        match self {
            SampleValue::Scalar(v) => vec![*v],
            SampleValue::Structured(channels) => channels.iter().map(|c| c.value).collect(),
        }
    }

    /// Short human-readable rendering for monitor previews.
    pub fn preview(&self) -> String {
        match self {
            SampleValue::Scalar(v) => format!("{v:.2}"),
            SampleValue::Structured(channels) => {
                let parts: Vec<String> = channels
                    .iter()
                    .map(|c| format!("{}={:.2}", c.name, c.value))
                    .collect();
                format!("{{{}}}", parts.join(" "))
            }
        }
    }
}

impl Serialize for SampleValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SampleValue::Scalar(v) => serializer.serialize_f64(*v),
            SampleValue::Structured(channels) => {
                let mut map = serializer.serialize_map(Some(channels.len()))?;
                for channel in channels {
                    map.serialize_entry(&channel.name, &channel.value)?;
                }
                map.end()
            }
        }
    }
}

/// One captured observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub value: SampleValue,
    pub timestamp: DateTime<Utc>,
}

/// Raised once per finished, non-empty collection session.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionComplete {
    pub label: String,
    pub samples: Vec<Sample>,
    pub sample_rate_hz: u32,
    pub completion_time: DateTime<Utc>,
    /// Last sample timestamp minus the first, in milliseconds.
    pub duration_ms: i64,
}
