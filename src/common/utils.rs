//! Utility functions for minikv-pd

use crate::common::error::{Error, ErrorKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(last)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Human-readable partition descriptor, e.g. `ns0-3`.
pub fn partition_desc(name: &str, partition: i32) -> String {
    format!("{}-{}", name, partition)
}

/// Log level a failed placement step is reported at.
pub fn failure_level(err: &Error) -> tracing::Level {
    match err.kind() {
        ErrorKind::Transient | ErrorKind::Conflict => tracing::Level::INFO,
        ErrorKind::Store => tracing::Level::WARN,
        ErrorKind::Fatal => tracing::Level::ERROR,
    }
}

/// Log a failed placement step. Rejected plans are routine, failing
/// register calls are not.
pub fn log_failure(what: fmt::Arguments<'_>, err: &Error) {
    let level = failure_level(err);
    if level == tracing::Level::ERROR {
        tracing::error!("{}: {}", what, err);
    } else if level == tracing::Level::WARN {
        tracing::warn!("{}: {}", what, err);
    } else {
        tracing::info!("{}: {}", what, err);
    }
}

/// Exclusive "skip, don't queue" guard over an atomic flag.
///
/// Acquiring flips the flag from false to true; dropping the guard clears it.
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    /// Returns `None` when someone else already holds the flag.
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
