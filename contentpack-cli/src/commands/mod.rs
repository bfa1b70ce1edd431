//! CLI command implementations.

pub mod binaries;
pub mod cancel;
pub mod config;
pub mod download;
pub mod status;
