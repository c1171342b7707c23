//! ChunkIO volume engine
//!
//! This crate implements chunked volumes: backup media split into
//! fixed-size numbered chunks on a remote blob backend, exposed to the
//! rest of the storage daemon as one random-access byte stream per
//! volume. It provides:
//! - The single in-memory chunk window per open volume
//! - The ordered deduplicating flush queue with reserved-slot retry
//! - The process-wide inflight registry guarding concurrent uploads
//! - The upload worker pool with retry and read-only fencing
//! - The top-level device: open / read / write / seek / truncate /
//!   close / flush and volume-size discovery

pub mod device;
pub mod inflight;
pub mod queue;
pub mod setup;
mod window;
mod worker;

// Re-exports
pub use device::{ChunkedDevice, EngineConfig, EngineStats, OpenMode};
pub use inflight::{InflightLease, InflightRegistry};
pub use queue::{Enqueued, FlushQueue, FlushRequest, PendingFlush};
pub use setup::setup_device;
