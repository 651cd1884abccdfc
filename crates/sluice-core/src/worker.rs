//! Worker identity parsing.
//!
//! Every engine process in a cluster carries a stable worker key of the form
//! `<prefix>-<number>`. The numeric suffix seeds the id generator, so it must
//! fit in 16 bits. Installing a custom [`crate::id::IdMinter`] lifts both the
//! format requirement and the range check.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.+-(\d+)$").expect("worker key pattern is valid"))
}

/// Parses the numeric suffix out of a worker key.
///
/// The key must look like `worker-1` or `prod-scheduler-42`; the number must
/// be in `0..=65535`.
///
/// # Errors
///
/// Returns [`Error::InvalidWorkerKey`] when the key does not match the
/// required format or the number is out of range.
pub fn parse_worker_number(key: &str) -> Result<u16> {
    let captures = key_pattern()
        .captures(key)
        .ok_or_else(|| Error::InvalidWorkerKey {
            message: format!("key '{key}' must look like 'xxx-1' or 'xxx-2'"),
        })?;

    let digits = captures
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or_default();

    digits.parse::<u16>().map_err(|_| Error::InvalidWorkerKey {
        message: format!("worker number '{digits}' must be in range 0..=65535"),
    })
}
