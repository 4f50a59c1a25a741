use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock predates the epoch")
        .as_secs()
}

/// Returns the current unix timestamp in microseconds. Queue age accounting
/// and log throttling are done in this resolution.
#[inline]
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock predates the epoch")
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolutions_agree() {
        let secs = timestamp_secs();
        let micros = timestamp_now();

        assert!(micros / 1_000_000 - secs as i64 <= 1);
    }

    #[test]
    fn test_monotonic_enough() {
        let a = timestamp_now();
        let b = timestamp_now();

        assert!(b >= a);
    }
}
