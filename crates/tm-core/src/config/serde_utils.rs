//! Serde helpers for configuration values

/// `Duration` stored as whole seconds
///
/// Writes an integer. Reads either an integer or a string with an `s`, `m`
/// or `h` suffix (`"90s"`, `"5m"`, `"1h"`), so hand-edited TOML can use
/// whichever reads better.
pub mod duration_secs {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SecondsVisitor)
    }

    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number of seconds or a string like \"30s\", \"5m\" or \"1h\"")
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse(value).ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    /// Parse `"<n>"`, `"<n>s"`, `"<n>m"` or `"<n>h"`
    pub fn parse(value: &str) -> Option<Duration> {
        let value = value.trim();
        let (digits, scale) = match value.char_indices().last()? {
            (i, 's') => (&value[..i], 1),
            (i, 'm') => (&value[..i], 60),
            (i, 'h') => (&value[..i], 3600),
            _ => (value, 1),
        };
        let n: u64 = digits.trim().parse().ok()?;
        n.checked_mul(scale).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        ready: Duration,
    }

    #[test]
    fn test_writes_whole_seconds() {
        let timeouts = Timeouts {
            ready: Duration::from_millis(30_900),
        };
        assert_eq!(toml::to_string(&timeouts).unwrap().trim(), "ready = 30");
    }

    #[test]
    fn test_reads_integers_and_suffixes() {
        let parsed: Timeouts = toml::from_str("ready = 45").unwrap();
        assert_eq!(parsed.ready, Duration::from_secs(45));

        let parsed: Timeouts = toml::from_str("ready = \"5m\"").unwrap();
        assert_eq!(parsed.ready, Duration::from_secs(300));

        assert_eq!(duration_secs::parse("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(duration_secs::parse(" 20s "), Some(Duration::from_secs(20)));
        assert_eq!(duration_secs::parse("15"), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(toml::from_str::<Timeouts>("ready = \"soon\"").is_err());
        assert!(toml::from_str::<Timeouts>("ready = -5").is_err());
        assert_eq!(duration_secs::parse("m"), None);
    }
}
