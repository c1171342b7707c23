//! Common types and utilities for ChunkIO
//!
//! This crate holds what every other ChunkIO crate shares:
//! - The crate-wide error taxonomy
//! - Chunk addressing (indices, four-digit chunk names)
//! - Device-option string parsing and typed device options

pub mod error;
pub mod options;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use options::{DeviceOptions, parse_device_options, parse_size};
pub use types::{DEFAULT_CHUNK_SIZE, MAX_CHUNKS, chunk_name, is_chunk_name, parse_chunk_name};
