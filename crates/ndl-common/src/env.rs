//! Environment variable helpers
//!
//! Configuration in this workspace is read from the process environment (optionally seeded
//! from a `.env` file by the binary). Unset variables fall back to defaults; set but
//! unparsable values are reported instead of silently ignored.

use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Read a required variable, treating an empty value as unset.
pub fn required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CommonError::MissingEnv(key.to_string())),
    }
}

/// Read an optional string variable.
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Read and parse a variable, falling back to `default` when unset.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| CommonError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        },
        _ => Ok(default),
    }
}

/// Read a comma-separated list, trimming entries and dropping empty ones.
pub fn list_or(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => split_list(&raw),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Split a comma-separated value the same way the environment helpers do.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
