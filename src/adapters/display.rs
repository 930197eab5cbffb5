//! Message display seam

use tracing::info;

/// Non-blocking informational messages for the patron
///
/// `key` identifies a message so it can be replaced or removed later.
pub trait MessageDisplay: Send + Sync {
    fn display_message(&self, key: &str, text: &str);

    fn remove_message(&self, key: &str);
}

/// Display that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageDisplay;

impl MessageDisplay for TracingMessageDisplay {
    fn display_message(&self, key: &str, text: &str) {
        info!(key = key, "DISPLAY: {}", text);
    }

    fn remove_message(&self, key: &str) {
        info!(key = key, "DISPLAY cleared");
    }
}
