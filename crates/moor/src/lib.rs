//! # moor
//!
//! Staged, reversible mounting of OCI images.
//!
//! A mount request walks up to three stages:
//! 1. the image itself, mounted read-only through the store's graph driver
//! 2. an optional writable overlay stacked on the image
//! 3. an optional recursive bind to a caller-chosen directory
//!
//! Each completed stage is recorded; when a later stage fails, the recorded
//! stages are undone in reverse order so a failed invocation leaves the
//! store exactly as it found it.
//!
//! ## Usage
//!
//! ```no_run
//! use moor::filesystem::{OverlayFs, RecursiveBind};
//! use moor::session::{MountRequest, MountSession};
//! use moor_store::{ImageReference, LocalStore, StoreOptions};
//!
//! # fn example() -> moor_common::MoorResult<()> {
//! let store = LocalStore::open(StoreOptions::auto_detect())?;
//! let overlay = OverlayFs::default();
//! let bind = RecursiveBind;
//! let session = MountSession::new(&store, &overlay, &bind);
//!
//! let outcome = session.mount(&MountRequest {
//!     reference: ImageReference::parse("alpine")?,
//!     overlay: true,
//!     bind: None,
//! })?;
//! println!("{}", outcome.view().display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod filesystem;
pub mod session;
pub mod unshare;

pub use session::MountSession;
