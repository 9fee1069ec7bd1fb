//! Configuration helpers shared by the store, the tier manager and the CLI.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g. "500ms", "90s", "1h30m", "7d").
///
/// A bare number is read as seconds. `"0"` is accepted and yields
/// `Duration::ZERO`, which the cache interprets as "no explicit TTL".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }

        let part = match unit.as_str() {
            "" | "s" => Duration::from_secs(num),
            "ms" => Duration::from_millis(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            "d" => Duration::from_secs(num * 86400),
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total += part;
    }

    Ok(total)
}

/// Default number of shards: twice the available hardware parallelism.
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

// =============================================================================
// Configuration Files
// =============================================================================

/// Parse a YAML configuration document
pub fn from_yaml<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_yaml::from_str(text)?)
}

/// Load a YAML configuration file
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    from_yaml(&text)
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1000;
    match secs {
        s if s % 86400 == 0 => format!("{}d", s / 86400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Serde adapter storing durations as human strings ("90s", "1h").
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_duration_bare_number_and_zero() {
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_default_shard_count_is_even_and_positive() {
        let n = default_shard_count();
        assert!(n >= 2);
        assert_eq!(n % 2, 0);
    }

    #[test]
    fn test_format_duration_round_trips_common_values() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(1800)), "30m");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(172800)), "2d");
        for d in [Duration::from_secs(90), Duration::from_millis(250)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_load_yaml_missing_file() {
        let result: Result<std::collections::HashMap<String, String>> =
            load_yaml("/nonexistent/tiercache.yaml");
        assert_matches!(result, Err(Error::Io(_)));
    }

    #[test]
    fn test_from_yaml_reports_parse_errors() {
        let result: Result<Vec<u32>> = from_yaml("{not: [a list");
        assert_matches!(result, Err(Error::ConfigFile(_)));
    }
}
