/// Heuristic record extraction from decoded device text.
///
/// Lines are tried against three formats in a fixed order: a delimited
/// multi-channel record, a bare number, and an embedded JSON object. The first
/// format that yields a value wins; lines matching none are dropped silently.
use crate::config::{ExtractorConfig, EXPECTED_CHANNELS};
use crate::sample::{Channel, SampleValue};
use regex::Regex;
use serde_json::Value;

/// Which format produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Delimited,
    BareNumeric,
    EmbeddedJson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: SampleValue,
    pub strategy: Strategy,
}

pub struct RecordExtractor {
    separator: String,
    channel_names: Vec<String>,
    header: Option<Regex>,
    json_keys: Vec<String>,
}

impl RecordExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self, regex::Error> {
        let tokens: Vec<String> = config
            .header_tokens
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| regex::escape(t.trim()))
            .collect();
        let header = if tokens.is_empty() {
            None
        } else {
            Some(Regex::new(&format!("(?i){}", tokens.join("|")))?)
        };

        Ok(Self {
            separator: config.separator.clone(),
            channel_names: config.channel_names.clone(),
            header,
            json_keys: config.json_keys.clone(),
        })
    }

    /// Extract every value from a chunk, one candidate per line, in line order.
    #[cfg(test)]
    pub fn extract(&self, text: &str) -> Vec<Extraction> {
        text.split('\n')
            .filter_map(|line| self.extract_line(line))
            .collect()
    }

    /// Extract at most one value from a single line.
    pub fn extract_line(&self, line: &str) -> Option<Extraction> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let is_header = self.is_header(line);

        // Delimited goes first: "1,2,3" must never be read as the scalar 1.
        if !is_header {
            if let Some(channels) = self.delimited(line) {
                return Some(Extraction {
                    value: SampleValue::Structured(channels),
                    strategy: Strategy::Delimited,
                });
            }
            if let Some(v) = parse_number(line) {
                return Some(Extraction {
                    value: SampleValue::Scalar(v),
                    strategy: Strategy::BareNumeric,
                });
            }
        }

        self.embedded_json(line).map(|v| Extraction {
            value: SampleValue::Scalar(v),
            strategy: Strategy::EmbeddedJson,
        })
    }

    fn is_header(&self, line: &str) -> bool {
        self.header.as_ref().is_some_and(|re| re.is_match(line))
    }

    fn delimited(&self, line: &str) -> Option<Vec<Channel>> {
        if !line.contains(self.separator.as_str()) {
            return None;
        }

        let values = line
            .split(self.separator.as_str())
            .map(parse_number)
            .collect::<Option<Vec<f64>>>()?;
        if values.len() < EXPECTED_CHANNELS {
            return None;
        }

        Some(
            values
                .into_iter()
                .enumerate()
                .map(|(i, value)| Channel::new(self.channel_name(i), value))
                .collect(),
        )
    }

    fn channel_name(&self, index: usize) -> String {
        self.channel_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("ch{index}"))
    }

    /// The line parsed as a JSON object, if it is one.
    pub fn json_object(&self, line: &str) -> Option<Value> {
        serde_json::from_str::<Value>(line.trim())
            .ok()
            .filter(Value::is_object)
    }

    fn embedded_json(&self, line: &str) -> Option<f64> {
        let parsed = self.json_object(line)?;
        let object = parsed.as_object()?;
        self.json_keys
            .iter()
            .find_map(|key| object.get(key).filter(|v| v.is_number()).and_then(Value::as_f64))
    }
}

/// Parse a whole field as a finite number; `NaN` and `inf` are not readings.
fn parse_number(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> RecordExtractor {
        RecordExtractor::new(&ExtractorConfig::default()).unwrap()
    }

    #[test]
    fn test_nine_fields_is_structured_not_scalar() {
        let got = extractor().extract_line("1,2,3,4,5,6,7,8,9").unwrap();
        assert_eq!(got.strategy, Strategy::Delimited);
        let SampleValue::Structured(channels) = got.value else {
            panic!("expected structured record");
        };
        assert_eq!(channels.len(), 9);
        assert_eq!(channels[0], Channel::new("timestamp", 1.0));
        assert_eq!(channels[8], Channel::new("ch8", 9.0));
    }

    #[test]
    fn test_extra_fields_get_positional_names() {
        let got = extractor()
            .extract_line("10, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9")
            .unwrap();
        let SampleValue::Structured(channels) = got.value else {
            panic!("expected structured record");
        };
        assert_eq!(channels.len(), 10);
        assert_eq!(channels[9].name, "ch9");
        assert_eq!(channels[9].value, 0.9);
    }

    #[test]
    fn test_bare_number_is_scalar() {
        let got = extractor().extract_line("42.5").unwrap();
        assert_eq!(got.value, SampleValue::Scalar(42.5));
        assert_eq!(got.strategy, Strategy::BareNumeric);
    }

    #[test]
    fn test_embedded_json_reading() {
        let got = extractor().extract_line(r#"{"reading": 7}"#).unwrap();
        assert_eq!(got.value, SampleValue::Scalar(7.0));
        assert_eq!(got.strategy, Strategy::EmbeddedJson);
    }

    #[test]
    fn test_json_key_priority_order() {
        let got = extractor()
            .extract_line(r#"{"data": 1, "touch": 2, "value": "n/a", "sensor": 3}"#)
            .unwrap();
        // "value" is not numeric, so the next key in priority order wins.
        assert_eq!(got.value, SampleValue::Scalar(3.0));
    }

    #[test]
    fn test_json_with_timestamp_key_is_data() {
        let got = extractor()
            .extract_line(r#"{"timestamp": 1200, "value": 4.5}"#)
            .unwrap();
        assert_eq!(got.value, SampleValue::Scalar(4.5));
    }

    #[test]
    fn test_json_without_candidate_key_dropped() {
        assert!(extractor().extract_line(r#"{"other": 7}"#).is_none());
        assert!(extractor().extract_line("[1, 2]").is_none());
    }

    #[test]
    fn test_json_object_only_for_objects() {
        let extractor = extractor();
        assert!(extractor.json_object(r#" {"x": 1} "#).is_some());
        assert!(extractor.json_object("[1, 2]").is_none());
        assert!(extractor.json_object("42").is_none());
        assert!(extractor.json_object("{broken").is_none());
    }

    #[test]
    fn test_plain_text_dropped() {
        assert!(extractor().extract_line("hello world").is_none());
    }

    #[test]
    fn test_header_lines_dropped() {
        let ex = extractor();
        assert!(ex.extract_line("timestamp").is_none());
        assert!(ex.extract_line("Timestamp,ax,ay,az,gx,gy,gz,mx,my").is_none());
        assert!(ex.extract_line("time 12").is_none());
    }

    #[test]
    fn test_short_delimited_line_dropped() {
        // Too few channels for a record, and not a single number either.
        assert!(extractor().extract_line("1,2,3").is_none());
    }

    #[test]
    fn test_delimited_with_non_numeric_field_dropped() {
        assert!(extractor().extract_line("1,2,3,4,x,6,7,8,9").is_none());
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let ex = extractor();
        assert!(ex.extract_line("NaN").is_none());
        assert!(ex.extract_line("inf").is_none());
    }

    #[test]
    fn test_whole_line_must_be_numeric() {
        assert!(extractor().extract_line("12abc").is_none());
    }

    #[test]
    fn test_chunk_lines_in_order_skipping_blanks() {
        let got = extractor().extract("1.5\r\n\n   \nnoise\n2.5\n{\"value\": 3}\n");
        let values: Vec<SampleValue> = got.into_iter().map(|e| e.value).collect();
        assert_eq!(
            values,
            vec![
                SampleValue::Scalar(1.5),
                SampleValue::Scalar(2.5),
                SampleValue::Scalar(3.0)
            ]
        );
    }

    #[test]
    fn test_custom_separator() {
        let config = ExtractorConfig {
            separator: "\t".to_string(),
            ..Default::default()
        };
        let ex = RecordExtractor::new(&config).unwrap();
        let got = ex.extract_line("1\t2\t3\t4\t5\t6\t7\t8\t9").unwrap();
        assert_eq!(got.strategy, Strategy::Delimited);
    }

    #[test]
    fn test_no_header_tokens_disables_header_check() {
        let config = ExtractorConfig {
            header_tokens: Vec::new(),
            ..Default::default()
        };
        let ex = RecordExtractor::new(&config).unwrap();
        assert!(ex.extract_line("timestamp").is_none());
        assert!(ex.extract_line("5").is_some());
    }
}
