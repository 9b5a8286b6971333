//! Core building blocks shared by the corpus builder crates.
//!
//! - `config`: layered configuration (file + `CORPUS__*` environment overrides)
//! - `hashing`: SHA-256 digests and the content-derived document identity
//! - `telemetry`: `tracing` subscriber bootstrap

pub mod config;
pub mod error;
pub mod hashing;
pub mod telemetry;

pub use self::config::*;
pub use self::error::*;
pub use self::hashing::{sha256_bytes, sha256_hex, Digest256, DocId};
pub use self::telemetry::{init_tracing, TracingConfig};
