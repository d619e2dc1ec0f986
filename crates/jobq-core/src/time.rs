use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::Rng;

/// Current wall-clock time as a BSON date (epoch milliseconds), the native
/// date type the store uses for every timestamp field.
pub fn now() -> bson::DateTime {
    bson::DateTime::now()
}

/// Sentinel written into `book_time` (and `finish_time` at insert) for a
/// job that has never been claimed / has never finished (the far-future
/// placeholder the original encodes as `boost::posix_time::max_date_time`).
pub fn sentinel_max() -> bson::DateTime {
    bson::DateTime::from_chrono(
        Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
            .single()
            .expect("valid far-future timestamp"),
    )
}

/// Sentinel written into `refresh_time` for a job that has never been
/// claimed (the far-past placeholder the original encodes as
/// `boost::posix_time::min_date_time`).
pub fn sentinel_min() -> bson::DateTime {
    bson::DateTime::from_millis(0)
}

/// Deadline for a claimed job: `book_time + timeout` seconds, or `None` if
/// the job carries no `timeout` (never trips).
pub fn deadline(book_time: bson::DateTime, timeout_secs: Option<u32>) -> Option<bson::DateTime> {
    let secs = i64::from(timeout_secs?);
    Some(bson::DateTime::from_millis(
        book_time.timestamp_millis() + secs * 1000,
    ))
}

/// Decorrelates the next poll tick so that competing Hub sweeps / Client
/// claims don't collide on the same `find_and_modify` cycle after cycle.
///
/// For `interval > 1s`: `1 + rand * (interval - 1)` seconds. For
/// `interval <= 1s`: `interval/2 + rand * interval/2`.
pub fn jittered_interval(interval: Duration) -> Duration {
    let secs = interval.as_secs_f64();
    let r: f64 = rand::thread_rng().r#gen();
    let delay_secs = if secs > 1.0 {
        1.0 + r * (secs - 1.0)
    } else {
        secs / 2.0 + r * secs / 2.0
    };
    Duration::from_secs_f64(delay_secs.max(0.0))
}
