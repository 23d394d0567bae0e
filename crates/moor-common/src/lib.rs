//! # moor-common
//!
//! Shared utilities and types for the moor mount orchestrator.
//!
//! This crate provides common functionality used across the moor crates:
//! - The common error taxonomy
//! - Standard store filesystem paths
//! - Unique name generation

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{MoorError, MoorResult, MountStage};
pub use paths::StorePaths;
