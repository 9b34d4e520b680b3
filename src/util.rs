use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::NaiveTime;

/// Compares two times-of-day, ignoring any notion of date.
///
/// Used for zone start-time lookups, which are defined purely in terms of
/// wall-clock time within a day. Never mix this up with [`compare_absolute`]
/// — that mistake is exactly the bug class intermediate-playlist firing
/// logic has to avoid.
pub fn compare_time_of_day(a: NaiveTime, b: NaiveTime) -> Ordering {
    a.cmp(&b)
}

/// Compares two absolute instants. Used for intermediate-playlist firing
/// and config/playlist mtime staleness checks, where wraparound at
/// midnight must never re-arm a burst early.
pub fn compare_absolute(a: SystemTime, b: SystemTime) -> Ordering {
    a.cmp(&b)
}

/// Fills a `u32` with cryptographically secure random bits.
///
/// `getrandom` already implements the platform fallback chain (syscall,
/// then `/dev/urandom`, etc) that the original program hand-rolled, so
/// there's no secondary fallback to write here.
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::fill(&mut buf).expect("system RNG unavailable");
    u32::from_ne_bytes(buf)
}

pub fn is_readable_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn time_of_day_exact_match_is_equal() {
        let a = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let b = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_eq!(compare_time_of_day(a, b), Ordering::Equal);
        assert_eq!(a.hour(), 6);
    }

    #[test]
    fn random_u32_is_not_trivially_zero_every_call() {
        // Flaky-in-theory, effectively never in practice for a real CSPRNG.
        let vals: Vec<u32> = (0..8).map(|_| random_u32()).collect();
        assert!(vals.iter().any(|v| *v != 0));
    }

    #[test]
    fn missing_file_is_not_readable() {
        assert!(!is_readable_file(Path::new("/nonexistent/path/for/test")));
    }
}
