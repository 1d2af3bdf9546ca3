// Trace sources with secret masking.
// Every component gets a named `Tracing`; all of them share one SecretMasker
// and one sink (the `tracing` crate in production, a collector in tests).

use crate::secret_masker::SecretMasker;
use lxdrunner_sdk::{TraceWriter, TracingTraceWriter};
use std::sync::Arc;

/// Severity of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// A named trace source that masks secrets before writing.
///
/// `for_instance` derives a child source whose messages are prefixed with
/// the instance name, so the lines of one lifecycle task can be grepped out
/// of an interleaved log.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    prefix: Option<String>,
    secret_masker: Arc<SecretMasker>,
    sink: Arc<dyn TraceWriter>,
}

impl Tracing {
    pub fn new(
        name: impl Into<String>,
        secret_masker: Arc<SecretMasker>,
        sink: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            secret_masker,
            sink,
        }
    }

    /// Child source whose messages start with `<instance>: `.
    pub fn for_instance(&self, instance: &str) -> Tracing {
        Tracing {
            prefix: Some(instance.to_string()),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        let line = match self.prefix {
            Some(ref p) => format!("[{}] {}: {}", self.name, p, message),
            None => format!("[{}] {}", self.name, message),
        };
        let masked = self.secret_masker.mask_secrets(&line);
        match event_type {
            TraceEventType::Error => self.sink.error(&masked),
            TraceEventType::Warning => self.sink.warning(&masked),
            TraceEventType::Information => self.sink.info(&masked),
            TraceEventType::Verbose => self.sink.verbose(&masked),
        }
    }

    /// Log an error followed by its source chain.
    pub fn error_err(&self, err: &dyn std::error::Error) {
        let mut text = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.error(&text);
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out trace sources that share a masker and a sink.
#[derive(Clone)]
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
    sink: Arc<dyn TraceWriter>,
}

impl TraceManager {
    /// Trace manager writing to the `tracing` crate.
    pub fn new(secret_masker: Arc<SecretMasker>) -> Self {
        Self::with_sink(secret_masker, Arc::new(TracingTraceWriter))
    }

    pub fn with_sink(secret_masker: Arc<SecretMasker>, sink: Arc<dyn TraceWriter>) -> Self {
        Self {
            secret_masker,
            sink,
        }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone(), self.sink.clone())
    }

    pub fn secret_masker(&self) -> &Arc<SecretMasker> {
        &self.secret_masker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxdrunner_sdk::{CollectingTraceWriter, TraceLevel};

    fn manager() -> (TraceManager, Arc<CollectingTraceWriter>) {
        let sink = Arc::new(CollectingTraceWriter::new());
        let masker = Arc::new(SecretMasker::new());
        (TraceManager::with_sink(masker, sink.clone()), sink)
    }

    #[test]
    fn test_messages_are_masked() {
        let (manager, sink) = manager();
        manager.secret_masker().add_value("ghp_secretvalue");
        manager.get("GitHub").info("using ghp_secretvalue");
        assert!(sink.contains(TraceLevel::Info, "[GitHub] using ***"));
        assert!(!sink.contains(TraceLevel::Info, "ghp_secretvalue"));
    }

    #[test]
    fn test_instance_prefix() {
        let (manager, sink) = manager();
        let trace = manager.get("Launcher").for_instance("lxdrunner-a1b2c3");
        trace.warning("guest agent not ready");
        assert!(sink.contains(
            TraceLevel::Warning,
            "[Launcher] lxdrunner-a1b2c3: guest agent not ready"
        ));
    }

    #[test]
    fn test_error_err_includes_chain() {
        let (manager, sink) = manager();
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let outer = anyhow::Error::new(inner).context("writing package");
        let err: &dyn std::error::Error = outer.as_ref();
        manager.get("Cache").error_err(err);
        assert!(sink.contains(TraceLevel::Error, "writing package: disk full"));
    }
}
