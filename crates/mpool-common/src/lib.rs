//! mpool Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, identifiers and configuration
//! used by the mlog and MDC engines.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, LOG_PAGE_SIZE, MAX_FLUSH_SET_BYTES, MlogConfig, PoolConfig};
pub use error::{Error, Result};
pub use types::*;
