//! Mount plumbing for the later pipeline stages.
//!
//! This module handles:
//! - Writable overlay workspaces and their overlayfs mounts
//! - Recursive bind links to caller-chosen directories

mod bind;
mod overlay;

pub use bind::{BindLinker, RecursiveBind};
pub use overlay::{OverlayFs, OverlayManager, OverlayWorkspace};
