//! Serde helpers shared by the configuration structs.

use std::time::Duration;

/// Parse a duration literal: either a bare integer (seconds) or a sequence
/// of `<number><unit>` segments with units `ms`, `s`, `m`, `h`, `d`
/// (`"300ms"`, `"5s"`, `"1h30m"`).
pub fn parse_duration(s: &str) -> Result<Duration, crate::ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::ConfigError::InvalidDuration(s.to_string()));
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = s
            .parse()
            .map_err(|_| crate::ConfigError::InvalidDuration(s.to_string()))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return Err(crate::ConfigError::InvalidDuration(s.to_string()));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| crate::ConfigError::InvalidDuration(s.to_string()))?;
        rest = &rest[digits..];
        let unit_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        let (unit, tail) = rest.split_at(unit_len);
        rest = tail;
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            _ => return Err(crate::ConfigError::InvalidDuration(s.to_string())),
        };
    }
    Ok(total)
}

/// Serde module for duration fields: accepts an integer number of seconds
/// or a string handled by [`parse_duration`]. Use with
/// `#[serde(with = "crate::de::duration")]`.
pub mod duration {
    use super::parse_duration;
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

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
            Raw::Text(s) => parse_duration(&s).map_err(D::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }
}
