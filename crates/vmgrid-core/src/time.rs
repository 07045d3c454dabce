//! Wall-clock helpers. All timestamps are unix seconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds in one hour, the unit flavor prices are quoted in.
pub const SECS_PER_HOUR: u64 = 3600;

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parse a duration string like "30s", "5m", "1h" into seconds.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok()
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| m * 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| h * SECS_PER_HOUR)
    } else {
        s.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration_secs("30s"), Some(30));
        assert_eq!(parse_duration_secs("5m"), Some(300));
        assert_eq!(parse_duration_secs("2h"), Some(7200));
        assert_eq!(parse_duration_secs(" 42 "), Some(42));
        assert_eq!(parse_duration_secs("soon"), None);
    }

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        // After 2020-01-01.
        assert!(epoch_secs() > 1_577_836_800);
    }
}
