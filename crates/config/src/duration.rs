//! Compact duration tokens used throughout the config file.
//!
//! A duration is one or more `<digits><unit>` tokens, e.g. `"30s"`, `"5m"`,
//! `"1D12h"`. Date-scale units are `Y`/`y` (365 days), `M` (30 days) and
//! `D`/`d` (days); time-scale units are `h`, `m` and `s`. Note that `M` is
//! months and `m` is minutes.

use std::{fmt, str::FromStr, time::Duration};

use {
    mememo_common::{Error, Result},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

fn unit_seconds(unit: char) -> Option<u64> {
    match unit {
        'Y' | 'y' => Some(365 * DAY),
        'M' => Some(30 * DAY),
        'D' | 'd' => Some(DAY),
        'h' => Some(HOUR),
        'm' => Some(MINUTE),
        's' => Some(1),
        _ => None,
    }
}

/// Parse a compact duration string.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::validation("empty duration string"));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let Some(scale) = unit_seconds(c) else {
            return Err(Error::validation(format!(
                "unknown duration unit '{c}' in '{input}' (expected Y/y/M/D/d/h/m/s)"
            )));
        };
        if digits.is_empty() {
            return Err(Error::validation(format!(
                "duration unit '{c}' has no value in '{input}'"
            )));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::validation(format!("invalid number in duration: {digits}")))?;
        total = value
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| Error::validation(format!("duration overflows: {input}")))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(Error::validation(format!(
            "duration missing unit suffix: {input}"
        )));
    }

    Ok(Duration::from_secs(total))
}

/// A [`Duration`] that (de)serializes as a compact duration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompactDuration(pub Duration);

impl CompactDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    /// The same duration as a `chrono` delta, for timestamp arithmetic.
    ///
    /// Saturates at ten thousand years so adding it to "now" cannot overflow.
    pub fn as_chrono(self) -> chrono::TimeDelta {
        const CAP: Duration = Duration::from_secs(10_000 * 365 * DAY);
        chrono::TimeDelta::from_std(self.0.min(CAP)).unwrap_or_default()
    }
}

impl From<CompactDuration> for Duration {
    fn from(value: CompactDuration) -> Self {
        value.0
    }
}

impl FromStr for CompactDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_duration(s).map(Self)
    }
}

impl fmt::Display for CompactDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secs = self.0.as_secs();
        if secs == 0 {
            return f.write_str("0s");
        }
        for (unit, scale) in [('D', DAY), ('h', HOUR), ('m', MINUTE), ('s', 1)] {
            if secs >= scale {
                write!(f, "{}{unit}", secs / scale)?;
                secs %= scale;
            }
        }
        Ok(())
    }
}

impl Serialize for CompactDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CompactDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("30s", 30)]
    #[case("5m", 300)]
    #[case("2h", 7_200)]
    #[case("1d", 86_400)]
    #[case("1D", 86_400)]
    #[case("1M", 30 * 86_400)]
    #[case("1Y", 365 * 86_400)]
    #[case("1y", 365 * 86_400)]
    #[case("1D12h", 86_400 + 12 * 3_600)]
    #[case("  10m  ", 600)]
    #[case("0s", 0)]
    fn parses_tokens(#[case] input: &str, #[case] secs: u64) {
        assert_eq!(parse_duration(input).unwrap(), Duration::from_secs(secs));
    }

    #[rstest]
    #[case("")]
    #[case("100")]
    #[case("10x")]
    #[case("m")]
    #[case("5m3")]
    fn rejects_malformed(#[case] input: &str) {
        let err = parse_duration(input).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{input}: {err}");
    }

    #[test]
    fn chrono_delta_saturates() {
        let huge = CompactDuration(Duration::from_secs(u64::MAX));
        let now = chrono::Utc::now();
        assert!(now + huge.as_chrono() > now);
        assert_eq!(
            CompactDuration::from_secs(90).as_chrono(),
            chrono::TimeDelta::seconds(90)
        );
    }

    #[test]
    fn months_and_minutes_differ() {
        assert_ne!(parse_duration("1M").unwrap(), parse_duration("1m").unwrap());
    }

    #[test]
    fn display_is_parseable() {
        let d: CompactDuration = "1D2h3m4s".parse().unwrap();
        assert_eq!(d.to_string(), "1D2h3m4s");
        let again: CompactDuration = d.to_string().parse().unwrap();
        assert_eq!(d, again);
    }

    #[test]
    fn deserializes_from_string() {
        #[derive(Deserialize)]
        struct Entry {
            cache: CompactDuration,
        }
        let entry: Entry = toml::from_str("cache = \"1m\"").unwrap();
        assert_eq!(entry.cache.as_duration(), Duration::from_secs(60));

        let bad: std::result::Result<Entry, _> = toml::from_str("cache = \"1q\"");
        assert!(bad.is_err());
    }
}
