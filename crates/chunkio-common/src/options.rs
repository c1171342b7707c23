//! Device-option string parsing
//!
//! A chunked device is configured through a single option string, a
//! comma-separated list of `key=value` pairs. The keys the engine
//! consumes directly are typed out in [`DeviceOptions`]; everything else
//! is kept verbatim for the backend adapter, which accepts a key only if
//! the helper program announced it in its `options` handshake.

use crate::error::{Error, Result};
use crate::types::DEFAULT_CHUNK_SIZE;
use serde::Serialize;
use std::collections::BTreeMap;

/// Typed device options with their defaults applied.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOptions {
    /// Chunk size in bytes; configured values below 10 MiB are raised to
    /// the 10 MiB floor.
    pub chunk_size: u64,
    /// Number of upload worker threads (0 = flush synchronously in the
    /// calling thread).
    pub io_threads: u8,
    /// Flush-queue slots per worker thread.
    pub io_slots: u8,
    /// Upload attempts per chunk before the device is fenced read-only
    /// (0 = retry forever).
    pub retries: u8,
    /// Helper program path, absolute or relative to the scripts
    /// directory. Mandatory.
    pub program: String,
    /// Per-invocation helper timeout in seconds (0 = adapter default).
    pub program_timeout: u64,
    /// Options not consumed by the engine, to be offered to the adapter.
    pub extra: BTreeMap<String, String>,
}

impl DeviceOptions {
    /// Parse a device-option string into typed options.
    ///
    /// Fails on syntax errors, duplicate keys, unparseable values and a
    /// missing `program`. Unknown keys are not an error here; they end up
    /// in `extra` and setup fails later if the adapter does not claim
    /// them.
    pub fn parse(device_options: &str) -> Result<Self> {
        let mut map = parse_device_options(device_options)?;

        let chunk_size = match map.remove("chunksize") {
            Some(value) => parse_size(&value)?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let io_threads = take_int(&mut map, "iothreads", 0)?;
        let io_slots = take_int(&mut map, "ioslots", 10)?;
        let retries = take_int(&mut map, "retries", 0)?;
        let program_timeout = take_int(&mut map, "program_timeout", 0)?;

        let Some(program) = map.remove("program") else {
            return Err(Error::config("option 'program' is required"));
        };
        if program.is_empty() {
            return Err(Error::config("option 'program' is required"));
        }

        Ok(Self {
            chunk_size: chunk_size.max(DEFAULT_CHUNK_SIZE),
            io_threads,
            io_slots,
            retries,
            program,
            program_timeout,
            extra: map,
        })
    }
}

/// Tokenize a device-option string into a key/value map.
///
/// Keys are taken as-is; a pair without `=` is a bare flag with an empty
/// value. Duplicate keys are a configuration error.
pub fn parse_device_options(device_options: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in device_options.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (pair, ""),
        };
        if key.is_empty() {
            return Err(Error::config(format!("malformed device option '{pair}'")));
        }
        if map.insert(key.to_string(), value.to_string()).is_some() {
            return Err(Error::config(format!("duplicate device option '{key}'")));
        }
    }
    Ok(map)
}

/// Parse a size value with the classic storage-daemon suffixes: bare
/// `k`/`m`/`g` are binary multiples, `kb`/`mb`/`gb` decimal, and the
/// spelled-out `kib`/`mib`/`gib` binary again.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    if digits.is_empty() {
        return Err(Error::config(format!("invalid size value '{value}'")));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::config(format!("invalid size value '{value}'")))?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "kb" => 1000,
        "m" | "mib" => 1 << 20,
        "mb" => 1_000_000,
        "g" | "gib" => 1 << 30,
        "gb" => 1_000_000_000,
        other => {
            return Err(Error::config(format!("unknown size suffix '{other}'")));
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("size value '{value}' is out of range")))
}

fn take_int<T>(map: &mut BTreeMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match map.remove(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid value '{value}' for option '{key}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4kb").unwrap(), 4000);
        assert_eq!(parse_size("4kib").unwrap(), 4096);
        assert_eq!(parse_size("10 MB").unwrap(), 10_000_000);
        assert_eq!(parse_size("10 MiB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("10 floppies").is_err());
        assert!(parse_size("99999999999999999999").is_err());
    }

    #[test]
    fn test_tokenizer() {
        let map = parse_device_options("program=s3.sh,iothreads=2, bucket=backup ,flag").unwrap();
        assert_eq!(map["program"], "s3.sh");
        assert_eq!(map["iothreads"], "2");
        assert_eq!(map["bucket"], "backup");
        assert_eq!(map["flag"], "");
    }

    #[test]
    fn test_tokenizer_rejects_duplicates() {
        assert!(parse_device_options("retries=1,retries=2").is_err());
        assert!(parse_device_options("=value").is_err());
    }

    #[test]
    fn test_device_options_defaults() {
        let opts = DeviceOptions::parse("program=/usr/lib/chunkio/s3.sh").unwrap();
        assert_eq!(opts.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(opts.io_threads, 0);
        assert_eq!(opts.io_slots, 10);
        assert_eq!(opts.retries, 0);
        assert_eq!(opts.program_timeout, 0);
        assert!(opts.extra.is_empty());
    }

    #[test]
    fn test_device_options_chunk_size_floor() {
        // "10 MB" is decimal and below the 10 MiB floor; it gets raised.
        let opts = DeviceOptions::parse("program=x,chunksize=10 MB").unwrap();
        assert_eq!(opts.chunk_size, DEFAULT_CHUNK_SIZE);

        let opts = DeviceOptions::parse("program=x,chunksize=64 MiB").unwrap();
        assert_eq!(opts.chunk_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_device_options_require_program() {
        let err = DeviceOptions::parse("iothreads=2").unwrap_err();
        assert!(err.to_string().contains("program"));
    }

    #[test]
    fn test_device_options_keep_extras() {
        let opts =
            DeviceOptions::parse("program=x,retries=3,bucket=backup,region=eu-1").unwrap();
        assert_eq!(opts.retries, 3);
        assert_eq!(opts.extra.len(), 2);
        assert_eq!(opts.extra["bucket"], "backup");
        assert_eq!(opts.extra["region"], "eu-1");
    }
}
