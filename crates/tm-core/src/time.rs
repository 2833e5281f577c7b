//! Time utilities for tunnel-manager

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get the current UTC timestamp.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Time elapsed since `since`.
///
/// Returns Duration::ZERO if the given time is in the future.
pub fn elapsed_since(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}
