use crate::results::ResultSet;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
}

impl From<MessageLevel> for detector_proto::MessageLevel {
    fn from(level: MessageLevel) -> Self {
        match level {
            MessageLevel::Silent => Self::Silent,
            MessageLevel::Error => Self::Error,
            MessageLevel::Warn => Self::Warn,
            MessageLevel::Info => Self::Info,
            MessageLevel::Debug => Self::Debug,
        }
    }
}

impl From<detector_proto::MessageLevel> for MessageLevel {
    fn from(level: detector_proto::MessageLevel) -> Self {
        match level {
            detector_proto::MessageLevel::Silent => Self::Silent,
            detector_proto::MessageLevel::Error => Self::Error,
            detector_proto::MessageLevel::Warn => Self::Warn,
            detector_proto::MessageLevel::Info => Self::Info,
            detector_proto::MessageLevel::Debug => Self::Debug,
        }
    }
}

/// One-way channel back to the caller of a job.
pub trait DetectorCallback: Send + Sync {
    fn message(&self, level: MessageLevel, text: &str);
    fn found_new_results(&self, results: &ResultSet);
}

/// Logs locally and relays the same text to the caller.
pub fn report(callback: &dyn DetectorCallback, level: MessageLevel, text: &str) {
    match level {
        MessageLevel::Silent => return,
        MessageLevel::Error => tracing::error!("{}", text),
        MessageLevel::Warn => tracing::warn!("{}", text),
        MessageLevel::Info => tracing::info!("{}", text),
        MessageLevel::Debug => tracing::debug!("{}", text),
    }
    callback.message(level, text);
}
