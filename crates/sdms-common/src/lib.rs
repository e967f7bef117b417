//! SDMS Common - Shared types and utilities
//!
//! This crate provides the vocabulary shared by every SDMS component:
//! target classes, stage targets, job statuses, catalog attribute values,
//! the common error type and the configuration tree.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
