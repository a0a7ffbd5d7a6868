//! Duration strings used in service configs: `"250ms"`, `"3s"`, `"1m"`, `"2h"`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::Duration {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty duration string"));
    }

    // Boundary between digits and suffix.
    let idx = trimmed
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit suffix"))?;
    if idx == 0 {
        return Err(invalid("missing number"));
    }

    let (num_part, unit_part) = trimmed.split_at(idx);
    let value: u64 = num_part.parse().map_err(|_| invalid("number out of range"))?;

    let secs_per = match unit_part.trim().to_lowercase().as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(invalid("expected ms, s, m, or h")),
    };
    value
        .checked_mul(secs_per)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("number out of range"))
}

/// `#[serde(deserialize_with = ...)]` adapter for duration strings.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
