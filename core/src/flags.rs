use std::time::Duration;

use env_flags::env_flags;

/// Parse a millisecond value, falling back to `default_ms` when the value
/// is missing, unparsable, or outside `[min_ms, max_ms]`. Invalid values
/// never fail the process; they silently take the documented default.
fn timeout_ms(value: &str, min_ms: u64, max_ms: u64, default_ms: u64) -> Duration {
    let parsed = value.trim().parse::<u64>().unwrap_or(default_ms);
    let validated = if (min_ms..=max_ms).contains(&parsed) {
        parsed
    } else {
        default_ms
    };
    Duration::from_millis(validated)
}

env_flags! {
    /// Per-request timeout in milliseconds (1s – 1h).
    pub REQUEST_TIMEOUT: Duration = Duration::from_millis(120_000), |value| {
        Ok::<Duration, std::convert::Infallible>(timeout_ms(&value, 1_000, 3_600_000, 120_000))
    };

    /// Per-operation timeout in milliseconds (1s – 2h), covering a full
    /// provider call including all retries.
    pub MAX_OPERATION_TIMEOUT: Duration = Duration::from_millis(300_000), |value| {
        Ok::<Duration, std::convert::Infallible>(timeout_ms(&value, 1_000, 7_200_000, 300_000))
    };

    /// Stream-activity timeout in milliseconds (5s – 10min): the longest a
    /// streaming response may stay silent between events.
    pub ENGINE_ACTIVITY_TIMEOUT: Duration = Duration::from_millis(180_000), |value| {
        Ok::<Duration, std::convert::Infallible>(timeout_ms(&value, 5_000, 600_000, 180_000))
    };

    /// Attempts per provider before giving up (and, when configured,
    /// falling back to the secondary provider).
    pub SCOUT_REQUEST_MAX_RETRIES: u64 = 4;

    /// Debug verbosity (`DEBUG=1`); may be consulted anywhere.
    pub DEBUG: bool = false, |value| {
        Ok::<bool, std::convert::Infallible>(matches!(value.trim(), "1" | "true" | "yes"))
    };
    pub VERBOSE: bool = false, |value| {
        Ok::<bool, std::convert::Infallible>(matches!(value.trim(), "1" | "true" | "yes"))
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn in_range_values_are_kept() {
        assert_eq!(
            timeout_ms("30000", 1_000, 3_600_000, 120_000),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn invalid_values_fall_back_to_default() {
        assert_eq!(
            timeout_ms("soon", 1_000, 3_600_000, 120_000),
            Duration::from_secs(120)
        );
        assert_eq!(
            timeout_ms("50", 1_000, 3_600_000, 120_000),
            Duration::from_secs(120),
            "below range"
        );
        assert_eq!(
            timeout_ms("999999999999", 1_000, 3_600_000, 120_000),
            Duration::from_secs(120),
            "above range"
        );
    }
}
