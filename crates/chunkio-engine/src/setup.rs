//! Device setup
//!
//! Builds a [`ChunkedDevice`] over a helper program from a single
//! device-option string. The engine consumes its own keys, then offers
//! every remaining key to the helper: the helper's `options` handshake
//! decides which are accepted, and any key nobody claims fails setup.

use crate::device::{ChunkedDevice, EngineConfig};
use chunkio_backend::HelperStore;
use chunkio_common::{DeviceOptions, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Set up a chunked device from its device-option string.
///
/// A relative `program` path is resolved against `scripts_dir`. Fails
/// without partial state on a missing program, an unparseable value or
/// an option that neither the engine nor the helper recognizes.
pub fn setup_device(device_options: &str, scripts_dir: Option<&Path>) -> Result<ChunkedDevice> {
    let opts = DeviceOptions::parse(device_options)?;
    debug!(
        chunk_size = opts.chunk_size,
        io_threads = opts.io_threads,
        io_slots = opts.io_slots,
        retries = opts.retries,
        program = %opts.program,
        "setting up chunked device"
    );

    let mut store = HelperStore::new(&opts.program, scripts_dir)?;
    store.set_program_timeout(opts.program_timeout);

    let supported = store
        .supported_options()
        .map_err(|e| Error::config(format!("cannot get supported options: {e}")))?;

    let mut remaining = opts.extra.clone();
    for name in &supported {
        if let Some(value) = remaining.remove(name) {
            store.set_option(name, &value)?;
        }
    }
    if !remaining.is_empty() {
        let names: Vec<_> = remaining.keys().cloned().collect();
        return Err(Error::config(format!(
            "unknown options encountered: {}",
            names.join(", ")
        )));
    }

    Ok(ChunkedDevice::new(EngineConfig::from(&opts), Arc::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkio_common::DEFAULT_CHUNK_SIZE;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const HELPER: &str = r#"#!/bin/sh
case "$1" in
  options)
    echo "BUCKET"
    echo "REGION"
    ;;
  testconnection)
    exit 0
    ;;
esac
"#;

    fn scripts_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crud-helper.sh");
        fs::write(&path, HELPER).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn test_setup_builds_device() {
        let dir = scripts_dir();
        let dev = setup_device(
            "program=crud-helper.sh,iothreads=2,BUCKET=backup",
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(dev.chunk_size(), DEFAULT_CHUNK_SIZE);
        dev.check_connection().unwrap();
    }

    #[test]
    fn test_setup_requires_program() {
        let dir = scripts_dir();
        let err = setup_device("iothreads=1", Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("program"));
    }

    #[test]
    fn test_setup_rejects_missing_helper() {
        let dir = scripts_dir();
        let err = setup_device("program=nope.sh", Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_setup_rejects_unclaimed_options() {
        let dir = scripts_dir();
        let err = setup_device(
            "program=crud-helper.sh,BUCKET=backup,flavor=crunchy",
            Some(dir.path()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("flavor"));
    }

    #[test]
    fn test_setup_applies_chunk_size_floor() {
        let dir = scripts_dir();
        let dev = setup_device(
            "program=crud-helper.sh,chunksize=1 MiB",
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(dev.chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
