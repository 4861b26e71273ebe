//! Serde support for humane duration strings.
//!
//! Configuration files express durations as `"500ms"`, `"30s"`, `"5m"` or
//! `"1h"`; a bare integer is taken as seconds. Used with
//! `#[serde(with = "polyrelay_core::common::duration_serde")]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Parse a duration string of the form `<number><unit>` where unit is one of
/// `ms`, `s`, `m`, `h` (default `s` when no unit is given).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };

    let value: u64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration value: {s}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit: {other}")),
    }
}

/// Render a duration with the coarsest exact unit.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if duration.subsec_millis() != 0 || (secs == 0 && duration.as_millis() > 0) {
        format!("{}ms", duration.as_millis())
    } else if secs % 3600 == 0 && secs > 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs > 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    format_duration(*duration).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Same codec for `Option<Duration>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super")] Duration);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}
