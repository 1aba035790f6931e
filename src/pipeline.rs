/// Glue between the read loop and the collection session.
use crate::config::ExtractorConfig;
use crate::connection::ChunkConsumer;
use crate::decode::LineAssembler;
use crate::extractor::RecordExtractor;
use crate::monitor::Monitor;
use crate::session::{CollectionSession, IntakeOutcome};
use std::sync::Mutex;
use tracing::trace;

/// Echoes every chunk to the monitor and, while a session is active, feeds
/// extracted values into it.
pub struct CapturePipeline {
    monitor: Monitor,
    session: CollectionSession,
    extractor: RecordExtractor,
    lines: Mutex<LineAssembler>,
}

impl CapturePipeline {
    pub fn new(
        config: &ExtractorConfig,
        session: CollectionSession,
        monitor: Monitor,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            monitor,
            session,
            extractor: RecordExtractor::new(config)?,
            lines: Mutex::new(LineAssembler::new(
                config.reassemble_lines,
                config.max_line_bytes,
            )),
        })
    }
}

impl ChunkConsumer for CapturePipeline {
    fn on_chunk(&self, text: &str) {
        self.monitor.data(text);

        // Lines are assembled even while idle so a session never starts on a
        // half line.
        let lines = match self.lines.lock() {
            Ok(mut assembler) => assembler.push(text),
            Err(poisoned) => poisoned.into_inner().push(text),
        };
        if !self.session.is_active() {
            return;
        }

        for line in lines {
            let outcome = match self.extractor.extract_line(&line) {
                Some(extraction) => {
                    trace!(strategy = ?extraction.strategy, "extracted value");
                    self.session.record(extraction.value)
                }
                // Objects without a candidate key are kept whole when every
                // field is numeric.
                None => match self.extractor.json_object(&line) {
                    Some(object) => self.session.intake(&object),
                    None => continue,
                },
            };
            if outcome == IntakeOutcome::Inactive {
                // The timer fired mid-chunk.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::monitor::drain;
    use crate::sample::{Channel, SampleValue};
    use crate::session::SessionParams;
    use tokio::sync::watch;

    fn pipeline() -> (
        CapturePipeline,
        CollectionSession,
        tokio::sync::mpsc::UnboundedReceiver<crate::monitor::MonitorLine>,
        watch::Sender<ConnectionState>,
    ) {
        let (link, link_rx) = watch::channel(ConnectionState::Connected);
        let (monitor, lines) = Monitor::channel();
        let (session, _completions) = CollectionSession::new(link_rx, monitor.clone(), 50);
        let pipeline =
            CapturePipeline::new(&ExtractorConfig::default(), session.clone(), monitor).unwrap();
        (pipeline, session, lines, link)
    }

    fn start(session: &CollectionSession) {
        session
            .start(SessionParams {
                label: "tap".to_string(),
                duration_ms: 5_000,
                sample_rate_hz: 100,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_chunks_only_echoed() {
        let (pipeline, session, mut lines, _link) = pipeline();
        pipeline.on_chunk("1.0\n2.0\n");
        assert!(session.current_samples().is_empty());

        let echoed = drain(&mut lines);
        assert_eq!(echoed.len(), 1);
        assert!(!echoed[0].is_status);
        assert_eq!(echoed[0].text, "1.0\n2.0\n");
    }

    #[tokio::test]
    async fn test_active_session_collects_all_formats() {
        let (pipeline, session, _lines, _link) = pipeline();
        start(&session);
        pipeline.on_chunk("timestamp,a,b,c,d,e,f,g,h\n");
        pipeline.on_chunk("10,1,2,3,4,5,6,7,8\n42\n{\"touch\": 7}\nnoise\n");

        let samples = session.current_samples();
        assert_eq!(samples.len(), 3);
        assert!(matches!(samples[0].value, SampleValue::Structured(_)));
        assert_eq!(samples[1].value, SampleValue::Scalar(42.0));
        assert_eq!(samples[2].value, SampleValue::Scalar(7.0));
    }

    #[tokio::test]
    async fn test_split_line_collected_once() {
        let (pipeline, session, _lines, _link) = pipeline();
        start(&session);
        pipeline.on_chunk("12");
        pipeline.on_chunk(".5\n");
        let samples = session.current_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, SampleValue::Scalar(12.5));
    }

    #[tokio::test]
    async fn test_carriage_return_terminated_readings_collected() {
        let (pipeline, session, _lines, _link) = pipeline();
        start(&session);
        for _ in 0..2000 {
            pipeline.on_chunk("42.5\r");
        }
        let samples = session.current_samples();
        assert_eq!(samples.len(), 2000);
        assert!(samples.iter().all(|s| s.value == SampleValue::Scalar(42.5)));
    }

    #[tokio::test]
    async fn test_unterminated_reading_waits_for_line_end() {
        let (pipeline, session, _lines, _link) = pipeline();
        start(&session);
        pipeline.on_chunk("7");
        assert!(session.current_samples().is_empty());
        pipeline.on_chunk("\r\n");
        assert_eq!(session.current_samples()[0].value, SampleValue::Scalar(7.0));
    }

    #[tokio::test]
    async fn test_numeric_json_object_kept_as_structured() {
        let (pipeline, session, _lines, _link) = pipeline();
        start(&session);
        pipeline.on_chunk("{\"x\": 1, \"y\": -2.5}\n{\"state\": \"idle\"}\n");

        let samples = session.current_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].value,
            SampleValue::Structured(vec![Channel::new("x", 1.0), Channel::new("y", -2.5)])
        );
    }

    #[tokio::test]
    async fn test_partial_line_from_idle_period_not_split() {
        let (pipeline, session, _lines, _link) = pipeline();
        pipeline.on_chunk("99");
        start(&session);
        pipeline.on_chunk("9\n");
        assert_eq!(
            session.current_samples()[0].value,
            SampleValue::Scalar(999.0)
        );
    }
}
