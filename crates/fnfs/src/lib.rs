#![forbid(unsafe_code)]
//! FrankenNFS public API facade.
//!
//! Re-exports the client from `fnfs-core` through a stable external
//! interface. This is the crate that downstream consumers (CLI, harness)
//! depend on.

pub use fnfs_core::*;
