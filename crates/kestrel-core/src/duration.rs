// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ISO-8601 duration handling.
//!
//! Workflow definitions express delays, retry backoffs, and timeouts as
//! ISO-8601 durations (`PT5S`, `PT0.1S`, `P1D`). Calendar components (years,
//! months) are shifted on the calendar; everything below a day is treated as
//! a fixed number of seconds.

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Parse an ISO-8601 duration string.
pub fn parse(s: &str) -> Result<iso8601_duration::Duration> {
    s.parse::<iso8601_duration::Duration>()
        .map_err(|e| EngineError::internal_msg(format!("cannot parse ISO-8601 duration {s:?}: {e:?}")))
}

/// Shift a timestamp forward by an ISO-8601 duration.
pub fn shift(d: &iso8601_duration::Duration, from: DateTime<Utc>) -> DateTime<Utc> {
    let mut t = from;
    let months = d.year * 12.0 + d.month;
    if months > 0.0 {
        t = t + Months::new(months as u32);
    }
    let secs =
        d.day as f64 * 86_400.0 + d.hour as f64 * 3_600.0 + d.minute as f64 * 60.0 + d.second as f64;
    t + ChronoDuration::milliseconds((secs * 1_000.0) as i64)
}

/// The span an ISO-8601 duration covers starting at `from`.
pub fn span(s: &str, from: DateTime<Utc>) -> Result<Duration> {
    let d = parse(s)?;
    (shift(&d, from) - from)
        .to_std()
        .map_err(|e| EngineError::internal_msg(format!("negative duration {s:?}: {e}")))
}

/// The effective retry delay for a given attempt: `base * multiplier^attempt`.
///
/// A multiplier of `0` is treated as `1.0`.
pub fn backoff(base: Duration, multiplier: f64, attempt: i32) -> Duration {
    let multiplier = if multiplier == 0.0 { 1.0 } else { multiplier };
    Duration::from_secs_f64(base.as_secs_f64() * multiplier.powi(attempt))
}
