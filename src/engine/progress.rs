use std::sync::Mutex;

use log::{error, info};
use serde::Serialize;

/// Messages a sink receives while a step runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MigrationMessage {
    /// A phase started, or an operation inside it finished.
    Progress { message: String },
    /// A non-fatal problem, e.g. an advisory statement that changed nothing.
    Error { message: String },
    /// The step completed successfully.
    Complete,
    /// The step failed; the message names the failing operation.
    Failed { message: String },
}

/// Where the sequencer reports progress. Implementations must tolerate being
/// called from any phase, including after a failure.
pub trait OutputSink {
    fn announce_phase(&self, label: &str);

    fn announce_error(&self, message: &str);

    fn announce_complete(&self) {}

    fn announce_failed(&self, message: &str) {
        self.announce_error(message);
    }
}

/// Discards everything. Used for headless runs and tests.
pub struct NoopSink;

impl OutputSink for NoopSink {
    fn announce_phase(&self, _label: &str) {}

    fn announce_error(&self, _message: &str) {}
}

/// Forwards progress to the `log` facade.
pub struct LogSink;

impl OutputSink for LogSink {
    fn announce_phase(&self, label: &str) {
        info!("{}", label);
    }

    fn announce_error(&self, message: &str) {
        error!("{}", message);
    }

    fn announce_complete(&self) {
        info!("Migration complete");
    }

    fn announce_failed(&self, message: &str) {
        error!("Migration failed: {}", message);
    }
}

/// Keeps every message, in order, so callers can replay or serialize the
/// trace once the run ends.
#[derive(Default)]
pub struct HistorySink {
    history: Mutex<Vec<MigrationMessage>>,
}

impl HistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<MigrationMessage> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Labels of the `Progress` messages, in order.
    pub fn progress(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                MigrationMessage::Progress { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, msg: MigrationMessage) {
        if let Ok(mut history) = self.history.lock() {
            history.push(msg);
        }
    }
}

impl OutputSink for HistorySink {
    fn announce_phase(&self, label: &str) {
        self.push(MigrationMessage::Progress {
            message: label.to_string(),
        });
    }

    fn announce_error(&self, message: &str) {
        self.push(MigrationMessage::Error {
            message: message.to_string(),
        });
    }

    fn announce_complete(&self) {
        self.push(MigrationMessage::Complete);
    }

    fn announce_failed(&self, message: &str) {
        self.push(MigrationMessage::Failed {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_history_keeps_order_and_serializes_tagged() {
        let sink = HistorySink::new();
        sink.announce_phase("Renaming tables");
        sink.announce_error("No rows affected");
        sink.announce_complete();

        assert_eq!(sink.progress(), vec!["Renaming tables".to_string()]);
        let json = serde_json::to_string(&sink.messages()).unwrap();
        assert_eq!(
            json,
            r#"[{"type":"Progress","message":"Renaming tables"},{"type":"Error","message":"No rows affected"},{"type":"Complete"}]"#
        );
    }

    #[test]
    fn test_default_failed_falls_back_to_error() {
        struct Collect(Mutex<Vec<String>>);
        impl OutputSink for Collect {
            fn announce_phase(&self, _label: &str) {}
            fn announce_error(&self, message: &str) {
                self.0.lock().unwrap().push(message.to_string());
            }
        }
        let sink = Collect(Mutex::new(Vec::new()));
        sink.announce_failed("boom");
        assert_eq!(*sink.0.lock().unwrap(), vec!["boom".to_string()]);
    }
}
