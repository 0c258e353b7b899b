//! Console output through `tracing`.

use std::fmt::Write as _;

use super::Sink;
use crate::config::OutputFormat;
use crate::errors::SinkError;
use crate::record::{LogLevel, LogRecord};

/// Forwards each record to the installed `tracing` subscriber at the
/// record's own level.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink {
    format: OutputFormat,
}

impl ConsoleSink {
    /// Creates a console sink rendering in `format`.
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn render(&self, record: &LogRecord) -> String {
        match self.format {
            OutputFormat::Json => record.to_json().to_string(),
            OutputFormat::Pretty | OutputFormat::Compact => {
                let mut line = format!("[{}] {}", record.layer, record.message);
                if let Some(id) = record.correlation_id {
                    let _ = write!(line, " correlation_id={id}");
                }
                if let Some(key) = &record.key {
                    let _ = write!(line, " key={key}");
                }
                if let Some(duration) = record.duration {
                    let _ = write!(line, " duration_ms={:.3}", duration.as_secs_f64() * 1000.0);
                }
                if let Some(violation) = record.performance_violation {
                    let _ = write!(line, " performance_violation={violation}");
                }
                if let Some(error) = &record.error {
                    let _ = write!(line, " error={error:?}");
                }
                for (name, value) in &record.fields {
                    let _ = write!(line, " {name}={value}");
                }
                if record.orphaned {
                    line.push_str(" orphaned=true");
                }
                line
            }
        }
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    #[allow(clippy::cognitive_complexity)]
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let line = self.render(record);
        let logger = record.logger.as_str();

        match record.level {
            LogLevel::Trace => tracing::trace!(target: "reqscope::record", logger, "{}", line),
            LogLevel::Debug => tracing::debug!(target: "reqscope::record", logger, "{}", line),
            LogLevel::Info => tracing::info!(target: "reqscope::record", logger, "{}", line),
            LogLevel::Warn => tracing::warn!(target: "reqscope::record", logger, "{}", line),
            LogLevel::Error => tracing::error!(target: "reqscope::record", logger, "{}", line),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::types::Layer;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn emits_json_through_tracing() {
        let record = LogRecord::new(
            LogLevel::Info,
            RecordKind::Event,
            "order accepted",
            "orders",
            &Layer::Api,
        );
        ConsoleSink::new(OutputFormat::Json).emit(&record).unwrap();
        assert!(logs_contain("order accepted"));
        assert!(logs_contain("\"layer\":\"api\""));
    }

    #[traced_test]
    #[test]
    fn emits_key_value_in_compact_mode() {
        let record = LogRecord::new(
            LogLevel::Warn,
            RecordKind::Event,
            "slow",
            "orders",
            &Layer::Service,
        )
        .with_field("rows", serde_json::json!(3));
        ConsoleSink::new(OutputFormat::Compact).emit(&record).unwrap();
        assert!(logs_contain("[service] slow"));
        assert!(logs_contain("rows=3"));
    }
}
