//! Resource limits and caller-parameter validation for script execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::CancelFlag;

/// Default ceiling on caller-supplied timeouts, in seconds.
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 600;

/// Default cap on engine operations per run (0 disables the cap).
pub const DEFAULT_MAX_OPERATIONS: u64 = 10_000_000;

/// Default cap on captured print output, in bytes.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Rejected caller parameters. Always recoverable: the caller can resubmit
/// corrected input, and no engine work happens before validation passes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Timeout was zero or negative.
    #[error("timeout must be positive, got {0}")]
    NonPositiveTimeout(i64),
    /// Timeout was above the configured ceiling.
    #[error("timeout {got} exceeds maximum allowed ({max} seconds)")]
    TimeoutTooLarge {
        /// The rejected value.
        got: i64,
        /// The configured ceiling, in seconds.
        max: u64,
    },
}

/// Resource limits for one script execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget. `None` means unbounded.
    #[serde(with = "opt_duration_ms")]
    pub timeout: Option<Duration>,
    /// Maximum engine operations per run (0 = unlimited).
    pub max_operations: u64,
    /// Maximum captured print output in bytes.
    pub max_output_bytes: usize,
    /// Cooperative cancellation flag, observed by the engine's progress hook.
    #[serde(skip)]
    pub cancel: Option<CancelFlag>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            cancel: None,
        }
    }
}

impl ResourceLimits {
    /// Build limits from a caller-supplied timeout in seconds.
    ///
    /// Validation happens before any engine work: zero or negative timeouts
    /// and timeouts above `max_timeout_secs` are rejected.
    pub fn with_timeout_secs(
        timeout_secs: Option<i64>,
        max_timeout_secs: u64,
    ) -> Result<Self, ValidationError> {
        let timeout = match timeout_secs {
            None => None,
            Some(t) if t <= 0 => return Err(ValidationError::NonPositiveTimeout(t)),
            Some(t) if t as u64 > max_timeout_secs => {
                return Err(ValidationError::TimeoutTooLarge {
                    got: t,
                    max: max_timeout_secs,
                });
            }
            Some(t) => Some(Duration::from_secs(t as u64)),
        };
        Ok(Self {
            timeout,
            ..Self::default()
        })
    }

    /// Attach a cancellation flag to these limits.
    pub fn cancellable(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Helper for serializing `Option<Duration>` as milliseconds.
mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Buffer that collects printed lines up to a byte limit.
///
/// Lines past the limit are dropped and a single truncation marker is
/// recorded instead, so a runaway print loop cannot exhaust host memory.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: Vec<String>,
    bytes: usize,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    /// Create a buffer with the given byte limit.
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            limit,
            truncated: false,
        }
    }

    /// Record one printed line, in emission order.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        // Charge for the separator join() inserts before every line but the
        // first, so the cap reflects the joined output.
        let cost = line.len() + usize::from(!self.lines.is_empty());
        if self.bytes + cost > self.limit {
            self.truncated = true;
            self.lines.push("... [output truncated] ...".to_string());
            return;
        }
        self.bytes += cost;
        self.lines.push(line.to_string());
    }

    /// Captured output: lines joined in emission order.
    pub fn join(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether any line was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
