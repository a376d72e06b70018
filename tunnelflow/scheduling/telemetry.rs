use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Runtime;

/// Builder for [`ControlTelemetry`].
pub struct ControlTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetryBuilder {
    /// Builder scoped to a module label such as `scheduling.solver`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// JSON-lines log destination.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below this level.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Event sink for cycle-level events.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the handle.
    ///
    /// # Errors
    ///
    /// Fails when the log file cannot be opened.
    pub fn build(self) -> Result<ControlTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        Ok(ControlTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                min_level: self.min_level,
                logger,
                event: self.event_publisher.map(EventHandle::new),
            }),
        })
    }
}

/// Shared logging and event handle for controller components.
#[derive(Clone)]
pub struct ControlTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ControlTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.logger.is_some())
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    min_level: LogLevel,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_ok() {
            let publisher = Arc::clone(&self.publisher);
            tokio::spawn(async move {
                let _ = publisher.publish(record).await;
            });
            Ok(())
        } else {
            Runtime::new()?.block_on(self.publisher.publish(record))
        }
    }
}

impl ControlTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ControlTelemetryBuilder {
        ControlTelemetryBuilder::new(module)
    }

    /// Module label.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Same sinks under another module label.
    #[must_use]
    pub fn scoped(&self, module: impl Into<String>) -> Self {
        let inner = &self.inner;
        let logger = inner
            .logger
            .as_ref()
            .and_then(|logger| JsonLogger::new(logger.path()).ok())
            .map(|logger| logger.with_min_level(inner.min_level));
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                min_level: inner.min_level,
                logger,
                event: inner
                    .event
                    .as_ref()
                    .map(|handle| EventHandle::new(Arc::clone(&handle.publisher))),
            }),
        }
    }

    /// Writes a structured log record.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be written.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(LogRecord::new(&self.inner.module, level, message).with_metadata(metadata))
    }

    /// Writes a structured log record tagged with a control cycle.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be written.
    pub fn log_cycle(&self, level: LogLevel, message: &str, cycle: u64, metadata: Value) -> Result<()> {
        self.write(
            LogRecord::new(&self.inner.module, level, message)
                .with_cycle(cycle)
                .with_metadata(metadata),
        )
    }

    fn write(&self, record: LogRecord) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event.
    ///
    /// # Errors
    ///
    /// Fails when no runtime is available and publishing synchronously fails.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::{topics, MemoryEventBus};
    use shared_logging::read_records;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(4));
        let log_path = tmp.path().join("control.log");
        let telemetry = ControlTelemetry::builder("scheduling")
            .log_path(&log_path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log_cycle(LogLevel::Info, "cycle.solved", 3, json!({ "mode": "full" }))
            .unwrap();
        telemetry
            .event(topics::SOLVER_FALLBACK, json!({ "from": "full" }))
            .unwrap();
        let records = read_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cycle, Some(3));
        assert_eq!(bus.events_of(topics::SOLVER_FALLBACK).len(), 1);
    }

    #[test]
    fn min_level_filters_debug() {
        let tmp = tempdir().unwrap();
        let log_path = tmp.path().join("control.log");
        let telemetry = ControlTelemetry::builder("scheduling")
            .log_path(&log_path)
            .min_level(LogLevel::Warn)
            .build()
            .unwrap();
        telemetry.log(LogLevel::Debug, "noise", json!({})).unwrap();
        telemetry.log(LogLevel::Warn, "solver.fallback", json!({})).unwrap();
        assert_eq!(read_records(&log_path).unwrap().len(), 1);
    }
}
