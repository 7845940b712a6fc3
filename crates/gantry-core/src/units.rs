//! Parsing for duration and memory-size values supplied by runners and config files

use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::{GantryError, GantryResult};

/// Parse a duration such as `"300ms"`, `"10s"`, `"1m30s"` or `"1.5h"`.
///
/// A bare integer is taken as seconds.
pub fn parse_duration(input: &str) -> GantryResult<Duration> {
    let invalid = || GantryError::Validation(format!("invalid duration: {:?}", input));
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        nanos += value * per_unit;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Parse a memory size in bytes: `"8000000000"`, `"8G"`, `"16Gi"`, `"512MiB"`.
///
/// `K/M/G/T` are decimal multiples, `Ki/Mi/Gi/Ti` binary; a trailing `B` is ignored.
pub fn parse_memory(input: &str) -> GantryResult<u64> {
    let invalid = || GantryError::Validation(format!("invalid memory value: {:?}", input));
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    let unit = unit.trim();
    let unit = unit.strip_suffix('B').unwrap_or(unit);
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "KI" => 1 << 10,
        "MI" => 1 << 20,
        "GI" => 1 << 30,
        "TI" => 1 << 40,
        _ => return Err(invalid()),
    };

    if number.contains('.') {
        let value: f64 = number.parse().map_err(|_| invalid())?;
        Ok((value * multiplier as f64).round() as u64)
    } else {
        let value: u64 = number.parse().map_err(|_| invalid())?;
        value.checked_mul(multiplier).ok_or_else(invalid)
    }
}

/// Serde helper accepting either a byte count or a size string
pub fn deserialize_memory<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Bytes(b)) => Ok(Some(b)),
        Some(Raw::Text(t)) => parse_memory(&t)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
    }

    #[test]
    fn test_parse_duration_invalid() {
        for bad in ["", "abc", "5x", "s10", "1m30"] {
            assert!(parse_duration(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("8000000000").unwrap(), 8_000_000_000);
        assert_eq!(parse_memory("8G").unwrap(), 8_000_000_000);
        assert_eq!(parse_memory("8GB").unwrap(), 8_000_000_000);
        assert_eq!(parse_memory("16Gi").unwrap(), 16 * (1 << 30));
        assert_eq!(parse_memory("512MiB").unwrap(), 512 * (1 << 20));
        assert_eq!(parse_memory("1.5G").unwrap(), 1_500_000_000);
    }

    #[test]
    fn test_parse_memory_invalid() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("12Q").is_err());
        assert!(parse_memory("99999999999999999999").is_err());
    }

    #[test]
    fn test_deserialize_memory_variants() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "deserialize_memory")]
            memory: Option<u64>,
        }

        let h: Holder = toml::from_str("memory = 1024").unwrap();
        assert_eq!(h.memory, Some(1024));
        let h: Holder = toml::from_str("memory = \"1Ki\"").unwrap();
        assert_eq!(h.memory, Some(1024));
        let h: Holder = toml::from_str("").unwrap();
        assert_eq!(h.memory, None);
    }
}
