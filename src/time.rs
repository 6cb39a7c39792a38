//! Clock helpers: wall time in nanoseconds, timestamp rounding, tick
//! alignment, jitter and retry backoff.

use chrono::Utc;
use rand::Rng;
use std::cmp;
use std::time::{Duration, Instant};

/// Nanoseconds since the Unix epoch, wall clock.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos()
}

/// Nanoseconds elapsed since `i`, saturating.
pub fn elapsed_ns(i: Instant) -> u64 {
    duration_ns(i.elapsed())
}

/// A `Duration` as whole nanoseconds, saturating at `u64::MAX`.
pub fn duration_ns(d: Duration) -> u64 {
    (d.as_secs().saturating_mul(1_000_000_000)).saturating_add(u64::from(d.subsec_nanos()))
}

/// Round `ts` to the nearest multiple of `precision`, halves rounding up. A
/// precision of one nanosecond or less leaves `ts` untouched.
pub fn round_ns(ts: i64, precision: i64) -> i64 {
    if precision <= 1 {
        return ts;
    }
    let rem = ts.rem_euclid(precision);
    if rem >= precision / 2 {
        ts - rem + precision
    } else {
        ts - rem
    }
}

/// The default timestamp precision for a collection interval: the largest of
/// second, millisecond, microsecond or nanosecond not exceeding the interval.
pub fn precision_for(interval: Duration) -> Duration {
    if interval >= Duration::from_secs(1) {
        Duration::from_secs(1)
    } else if interval >= Duration::from_millis(1) {
        Duration::from_millis(1)
    } else if interval >= Duration::from_micros(1) {
        Duration::from_micros(1)
    } else {
        Duration::from_nanos(1)
    }
}

/// A pseudo-random offset in `[0, window)`. A zero window gives zero.
pub fn jitter(window: Duration) -> Duration {
    let nanos = duration_ns(window);
    if nanos == 0 {
        Duration::from_secs(0)
    } else {
        Duration::from_nanos(rand::thread_rng().gen_range(0, nanos))
    }
}

/// Time from the wall-clock instant `now` (nanoseconds since epoch) until the
/// next multiple of `interval`. When `now` is exactly on a boundary the result
/// is a full interval, never zero.
pub fn until_aligned(now: i64, interval: Duration) -> Duration {
    let step = duration_ns(interval) as i64;
    if step <= 0 {
        return Duration::from_secs(0);
    }
    let rem = now.rem_euclid(step);
    Duration::from_nanos((step - rem) as u64)
}

/// Capped exponential backoff. The first retry waits `base`, each following
/// attempt doubles, never exceeding `max`.
pub fn backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    if attempts == 0 {
        return Duration::from_secs(0);
    }
    let shift = cmp::min(attempts - 1, 31);
    let factor = 1u32 << shift;
    match base.checked_mul(factor) {
        Some(d) => cmp::min(d, max),
        None => max,
    }
}
