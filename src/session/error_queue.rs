//! Device error queue
//!
//! The instrument keeps its own FIFO of errors. Draining pops entries with the
//! `next_error` query until the queue reports empty or a budget runs out, so a
//! stuck queue can never hang the session.
//!
//! Parsing is total: any reply turns into a [`DeviceError`], malformed ones
//! carry [`PARSE_FAILURE_NUMBER`] and the raw text.

use super::TspSession;
use crate::error::{TspError, TspResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Error number given to replies that do not parse.
pub const PARSE_FAILURE_NUMBER: i32 = -1000;

static ERROR_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(-?\d+)\s*,\s*"((?:[^"\\]|\\.)*)"\s*(?:,\s*([^,]*?)\s*)?(?:,.*)?$"#)
        .unwrap_or_else(|e| panic!("invalid error reply pattern: {e}"))
});

/// Severity of a device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorLevel {
    /// Informational; never fails a step.
    Info,
    /// Recoverable condition.
    Warning,
    /// Serious error.
    Error,
}

impl ErrorLevel {
    /// Map the optional third reply field to a level.
    fn from_field(field: Option<&str>, number: i32) -> Self {
        let Some(field) = field.map(str::trim).filter(|f| !f.is_empty()) else {
            return if number == 0 {
                ErrorLevel::Info
            } else {
                ErrorLevel::Error
            };
        };
        if let Ok(severity) = field.parse::<f64>() {
            return if severity <= 10.0 {
                ErrorLevel::Info
            } else if severity <= 20.0 {
                ErrorLevel::Warning
            } else {
                ErrorLevel::Error
            };
        }
        match field.to_ascii_lowercase().as_str() {
            "info" | "informational" => ErrorLevel::Info,
            "warning" | "warn" | "recoverable" => ErrorLevel::Warning,
            _ => ErrorLevel::Error,
        }
    }
}

/// One entry popped from the instrument's error queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    /// Error code; 0 means no error.
    pub number: i32,
    /// Message text with quoting removed.
    pub message: String,
    /// Severity.
    pub level: ErrorLevel,
    /// Reply text as received.
    pub raw: String,
    /// When the entry was popped.
    pub observed_at: DateTime<Utc>,
}

impl DeviceError {
    /// The "no error" sentinel.
    pub fn none() -> Self {
        Self {
            number: 0,
            message: String::new(),
            level: ErrorLevel::Info,
            raw: String::new(),
            observed_at: Utc::now(),
        }
    }

    /// The entry is the "no error" sentinel.
    pub fn is_no_error(&self) -> bool {
        self.number == 0
    }

    /// Parse `<int>,"<message>"[,<level>]`. Never fails.
    pub fn parse(reply: &str) -> Self {
        let observed_at = Utc::now();
        let Some(caps) = ERROR_REPLY.captures(reply) else {
            return Self {
                number: PARSE_FAILURE_NUMBER,
                message: format!("Unparsable error reply: {}", reply.trim()),
                level: ErrorLevel::Error,
                raw: reply.to_string(),
                observed_at,
            };
        };
        let number = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .unwrap_or(PARSE_FAILURE_NUMBER);
        let message = caps
            .get(2)
            .map(|m| m.as_str().replace("\\\"", "\"").replace("\\\\", "\\"))
            .unwrap_or_default();
        let level = ErrorLevel::from_field(caps.get(3).map(|m| m.as_str()), number);
        Self {
            number,
            message,
            level,
            raw: reply.to_string(),
            observed_at,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},\"{}\" ({:?})", self.number, self.message, self.level)
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorQueue {
    errors: Vec<DeviceError>,
    last_error: DeviceError,
    exhausted: bool,
}

impl Default for DeviceErrorQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceErrorQueue {
    /// Empty queue ending on the sentinel.
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            last_error: DeviceError::none(),
            exhausted: false,
        }
    }

    /// Append an entry popped from the instrument.
    pub fn push(&mut self, error: DeviceError) {
        self.last_error = error.clone();
        self.errors.push(error);
    }

    /// Record that the instrument reported an empty queue.
    pub fn mark_empty(&mut self) {
        self.last_error = DeviceError::none();
    }

    /// Drained entries, oldest first.
    pub fn errors(&self) -> &[DeviceError] {
        &self.errors
    }

    /// Last entry seen, or the sentinel after a complete drain.
    pub fn last_error(&self) -> &DeviceError {
        &self.last_error
    }

    /// Nothing was drained.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of drained entries.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True if the drain stopped on its budget rather than on an empty queue.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Errors were drained and the queue did not end on the sentinel.
    pub fn has_device_error(&self) -> bool {
        !self.errors.is_empty() && self.last_error.number != 0
    }

    /// Compound message listing every entry.
    pub fn report(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Fail if any drained entry is a warning or an error.
    pub fn throw_if_error(&self, context: &str) -> TspResult<()> {
        let serious = self
            .errors
            .iter()
            .any(|e| matches!(e.level, ErrorLevel::Warning | ErrorLevel::Error));
        if serious {
            return Err(TspError::Device {
                context: context.to_string(),
                report: self.report(),
            });
        }
        Ok(())
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl TspSession {
    /// Pop every queued error from the instrument.
    ///
    /// Stops at the "no error" reply or when the iteration or time budget from
    /// the session settings runs out.
    pub async fn drain_error_queue(&self) -> TspResult<DeviceErrorQueue> {
        let max_iterations = self.config().error_drain_max_iterations;
        // A budget too large for an `Instant` leaves only the iteration cap.
        let deadline = Instant::now().checked_add(self.config().error_drain_timeout());
        let command = self.commands().next_error.clone();
        let sentinel = self.commands().no_error_reply.trim().to_string();

        let mut queue = DeviceErrorQueue::new();
        let mut drained = false;
        for _ in 0..max_iterations {
            let reply = self.query(&command).await?;
            let error = if reply == sentinel {
                DeviceError::none()
            } else {
                DeviceError::parse(&reply)
            };
            if error.is_no_error() {
                queue.mark_empty();
                drained = true;
                break;
            }
            debug!(number = error.number, message = %error.message, "Device error drained");
            queue.push(error);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }

        if !drained {
            queue.exhausted = true;
            warn!(
                drained = queue.len(),
                "Error queue drain stopped on its budget before the queue reported empty"
            );
        }
        self.store_error_queue(queue.clone()).await;
        Ok(queue)
    }

    /// Poll the status byte and drain only if it reports errors.
    pub async fn drain_if_error_available(&self) -> TspResult<DeviceErrorQueue> {
        let status = self.read_status_byte().await?;
        if status.error_available() {
            self.drain_error_queue().await
        } else {
            let queue = DeviceErrorQueue::new();
            self.store_error_queue(queue.clone()).await;
            Ok(queue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_reply() {
        let error = DeviceError::parse(r#"-113,"undefined header""#);
        assert_eq!(error.number, -113);
        assert_eq!(error.message, "undefined header");
        assert_eq!(error.level, ErrorLevel::Error);
    }

    #[test]
    fn test_parse_severity_levels() {
        assert_eq!(DeviceError::parse(r#"-285,"x",30"#).level, ErrorLevel::Error);
        assert_eq!(DeviceError::parse(r#"-285,"x",20"#).level, ErrorLevel::Warning);
        assert_eq!(DeviceError::parse(r#"5001,"x",0,1"#).level, ErrorLevel::Info);
        assert_eq!(DeviceError::parse(r#"5001,"x",warning"#).level, ErrorLevel::Warning);
    }

    #[test]
    fn test_parse_escaped_quotes() {
        let error = DeviceError::parse(r#"-286,"bad \"thing\"",30"#);
        assert_eq!(error.message, r#"bad "thing""#);
    }

    #[test]
    fn test_parse_is_total() {
        let error = DeviceError::parse("garbage");
        assert_eq!(error.number, PARSE_FAILURE_NUMBER);
        assert_eq!(error.raw, "garbage");
        assert!(!error.is_no_error());
    }

    #[test]
    fn test_has_device_error_after_clean_drain() {
        let mut queue = DeviceErrorQueue::new();
        queue.push(DeviceError::parse(r#"-113,"undefined header""#));
        assert!(queue.has_device_error());
        queue.mark_empty();
        assert!(!queue.has_device_error());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_throw_if_error_skips_info() {
        let mut queue = DeviceErrorQueue::new();
        queue.push(DeviceError::parse(r#"5001,"note",0"#));
        assert!(queue.throw_if_error("run").is_ok());

        queue.push(DeviceError::parse(r#"-285,"syntax",30"#));
        let err = queue.throw_if_error("run boot_me").unwrap_err();
        assert!(err.to_string().starts_with("run boot_me; device errors:"));
        assert!(err.to_string().contains("-285"));
    }
}
