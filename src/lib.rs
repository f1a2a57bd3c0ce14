//! Library exports for integration testing.
//!
//! The binary entrypoint lives in `main.rs`; this crate root just exposes
//! the modules it wires together so `tests/` can exercise them directly.

pub mod admission;
pub mod config;
pub mod image;
pub mod maps;
pub mod metrics;
pub mod reconciler;
pub mod swap;
pub mod tls;
