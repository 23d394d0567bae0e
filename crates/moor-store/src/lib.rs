//! # moor-store
//!
//! Image storage for the moor mount orchestrator.
//!
//! This crate provides:
//! - Image reference parsing and normalization
//! - Graph drivers that materialize layer stacks as mountable trees
//! - A local, reference-counting image store

#![warn(missing_docs)]

pub mod driver;
pub mod reference;
pub mod store;

pub use driver::GraphDriver;
pub use reference::ImageReference;
pub use store::{ImageStore, LocalStore, StoreOptions};
