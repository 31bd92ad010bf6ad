//! Utility functions used by Flock, and available when writing load tests.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time;

use crate::CANCELED;

lazy_static! {
    static ref TIMESPAN: Regex = Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$")
        .expect("failed to compile timespan regex");
}

/// Parse a time span into seconds.
///
/// A bare integer is seconds. Otherwise hours, minutes and seconds are given with the
/// "h", "m" and "s" suffixes, in that order: 20s, 3m, 2h, 1h20m, 3h30m10s. Anything
/// else is 0 seconds.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
/// assert_eq!(util::parse_timespan("45"), 45);
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    if let Ok(seconds) = time_str.parse::<usize>() {
        return seconds;
    }

    let Some(captures) = TIMESPAN.captures(time_str) else {
        return 0;
    };
    let seconds: usize = [3_600, 60, 1]
        .iter()
        .enumerate()
        .map(|(group, unit)| {
            captures
                .get(group + 1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(0)
                * unit
        })
        .sum();
    trace!("{} is {} seconds", time_str, seconds);
    seconds
}

/// Sleep for `duration`, less the time already elapsed on the `drift` timer.
///
/// Returns a fresh drift timer for the next call.
pub async fn sleep_minus_drift(
    duration: time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if !delay.is_zero() => tokio::time::sleep(delay).await,
        _ => debug!("already {:?} behind, not sleeping", drift.elapsed()),
    };
    tokio::time::Instant::now()
}

/// Greatest common divisor, used to reduce behavior weights.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::gcd(1, 100), 1);
/// assert_eq!(util::gcd(9, 102), 3);
/// assert_eq!(util::gcd(0, 7), 7);
/// ```
pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// The median of a histogram of rounded times, kept between the real `min` and `max`.
///
/// # Example
/// ```rust
/// use std::collections::BTreeMap;
/// use flock::util;
///
/// // Five times rounded to 7ms, one to 8ms, twenty-one to 13ms and so on.
/// let histogram = BTreeMap::from([(7, 5), (8, 1), (13, 21), (19, 44), (21, 5)]);
/// assert_eq!(util::median(&histogram, 76, 7, 21), 19);
/// ```
pub fn median(histogram: &BTreeMap<usize, usize>, count: usize, min: usize, max: usize) -> usize {
    let middle = count.div_ceil(2);
    let mut seen = 0;
    histogram
        .iter()
        .find(|(_, occurrences)| {
            seen += **occurrences;
            seen >= middle
        })
        .map_or(0, |(time, _)| (*time).clamp(min, max.max(min)))
}

/// Shorten a string to at most `max_length` characters, ending it with "..".
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(string: &str, max_length: usize) -> String {
    if string.chars().count() <= max_length {
        return string.to_string();
    }
    let mut truncated: String = string.chars().take(max_length.saturating_sub(2)).collect();
    truncated.push_str("..");
    truncated
}

/// Returns `true` once `run_time` seconds have passed since `started`. A `run_time`
/// of 0 never expires.
pub fn timer_expired(started: time::Instant, run_time: usize) -> bool {
    run_time > 0 && started.elapsed().as_secs() >= run_time as u64
}

/// Millisecond variation of [`timer_expired`].
pub fn ms_timer_expired(started: time::Instant, elapsed: usize) -> bool {
    elapsed > 0 && started.elapsed().as_millis() >= elapsed as u128
}

/// Parse a float option such as `--hatch-rate` or `--timeout`, logging invalid values.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::parse_float(Some("0.5")), Some(0.5));
/// assert_eq!(util::parse_float(Some("fast")), None);
/// assert_eq!(util::parse_float(None), None);
/// ```
pub fn parse_float(value: Option<&str>) -> Option<f32> {
    let value = value?;
    value
        .trim()
        .parse::<f32>()
        .map_err(|e| warn!("{:?} is not a number: {}", value, e))
        .ok()
}

// Shut down cleanly on the first ctrl-c, exit abruptly on the second.
pub(crate) fn setup_ctrlc_handler() {
    CANCELED.store(false, Ordering::SeqCst);
    if let Err(e) = ctrlc::set_handler(move || {
        if CANCELED.swap(true, Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
        }
    }) {
        // The handler is process-wide and can only be installed once, later load tests
        // in the same process (such as tests) reuse it.
        debug!("reusing ctrl-c handler: {}", e);
    }
}
