use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time};

/// A non-negative duration written in Go's `time.Duration` format, e.g.
/// `1s`, `500ms` or `1h30m`.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(time::Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("durations may not be negative")]
    Negative,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(time::Duration::from_millis(millis))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis().try_into().unwrap_or(u64::MAX)
    }

    /// Whole seconds, rounded up so that sub-second values stay positive.
    pub fn as_secs_ceil(&self) -> u64 {
        let secs = self.0.as_secs();
        if self.0.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl From<time::Duration> for Duration {
    fn from(d: time::Duration) -> Self {
        Self(d)
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(d): Duration) -> Self {
        d
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for Duration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unit(unit: &str) -> Result<time::Duration, ParseError> {
            const MINUTE: time::Duration = time::Duration::from_secs(60);
            Ok(match unit {
                "ns" => time::Duration::from_nanos(1),
                // U+00B5 is the micro sign and U+03BC is the Greek letter mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => time::Duration::from_micros(1),
                "ms" => time::Duration::from_millis(1),
                "s" => time::Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            })
        }

        let mut rest = s.trim();
        if let Some(r) = rest.strip_prefix('+') {
            rest = r;
        } else if rest.starts_with('-') {
            return Err(ParseError::Negative);
        }
        if rest == "0" {
            return Ok(Self::default());
        }
        if rest.is_empty() {
            return Err(ParseError::NoUnit);
        }

        let mut total = time::Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let value = value.parse::<f64>()?;
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (u, tail) = tail.split_at(unit_end);
            total += unit(u)?.mul_f64(value);
            rest = tail;
        }
        Ok(Self(total))
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as `1s` or `500ms`")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero("0", time::Duration::ZERO)]
    #[case::secs("5s", time::Duration::from_secs(5))]
    #[case::plus("+5s", time::Duration::from_secs(5))]
    #[case::fraction("5.6s", time::Duration::from_millis(5600))]
    #[case::leading_dot(".5s", time::Duration::from_millis(500))]
    #[case::millis("500ms", time::Duration::from_millis(500))]
    #[case::micros("10\u{00b5}s", time::Duration::from_micros(10))]
    #[case::compound("1h30m", time::Duration::from_secs(5400))]
    #[case::compound_fraction("1m0.5s", time::Duration::from_millis(60_500))]
    fn parses(#[case] input: &str, #[case] expected: time::Duration) {
        assert_eq!(input.parse::<Duration>(), Ok(Duration(expected)));
    }

    #[rstest]
    #[case::negative("-5s", ParseError::Negative)]
    #[case::no_unit("5", ParseError::NoUnit)]
    #[case::empty("", ParseError::NoUnit)]
    #[case::bad_unit("5d", ParseError::InvalidUnit)]
    fn rejects(#[case] input: &str, #[case] expected: ParseError) {
        assert_eq!(input.parse::<Duration>(), Err(expected));
    }

    #[test]
    fn display_round_trips() {
        for d in ["1s", "500ms", "2.5s"] {
            let parsed = d.parse::<Duration>().unwrap();
            assert_eq!(parsed.to_string(), d);
        }
    }

    #[test]
    fn conversions() {
        let d = Duration::from_millis(1500);
        assert_eq!(d.as_millis(), 1500);
        assert_eq!(d.as_secs_ceil(), 2);
        assert_eq!(Duration::from_secs(2).as_secs_ceil(), 2);
    }
}
