use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub point: Option<String>,
}

/// Output sink shared by every point of a run. Hooks receive its contents.
#[derive(Clone, Debug)]
pub struct RunLog {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl RunLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries.min(1024)))),
            max_entries: max_entries.max(1),
        }
    }

    pub fn add_log(&self, level: &str, message: String, point: Option<&str>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            point: point.map(str::to_string),
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    pub fn info(&self, point: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(point = point, "{}", message);
        self.add_log("info", message, Some(point));
    }

    pub fn warn(&self, point: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(point = point, "{}", message);
        self.add_log("warn", message, Some(point));
    }

    pub fn error(&self, point: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(point = point, "{}", message);
        self.add_log("error", message, Some(point));
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let log = RunLog::new(2);
        log.add_log("info", "one".into(), None);
        log.add_log("info", "two".into(), Some("app1"));
        log.add_log("error", "three".into(), Some("app1"));

        let entries = log.get_logs(None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].level, "error");
        assert_eq!(log.get_logs(Some(1))[0].message, "three");

        log.clear();
        assert!(log.get_logs(None).is_empty());
    }
}
