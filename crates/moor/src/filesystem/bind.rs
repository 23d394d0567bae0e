//! Bind mounts that expose a mounted view at a caller-chosen path.

use std::path::Path;

use moor_common::{MoorError, MoorResult, MountStage};

/// Links a mounted tree to a destination directory.
pub trait BindLinker {
    /// Bind `source` onto `dest`. The destination directory must already
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::StageFailed`] when the destination is missing
    /// or the bind cannot be established.
    fn bind(&self, source: &Path, dest: &Path) -> MoorResult<()>;

    /// Remove the bind at `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::UnmountFailed`] when the bind stays in place.
    fn unbind(&self, dest: &Path) -> MoorResult<()>;
}

/// Bind linker using a recursive bind with slave propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveBind;

#[cfg(target_os = "linux")]
impl BindLinker for RecursiveBind {
    fn bind(&self, source: &Path, dest: &Path) -> MoorResult<()> {
        use rustix::mount::{
            MountPropagationFlags, UnmountFlags, mount_bind_recursive, mount_change, unmount,
        };

        if !dest.is_dir() {
            return Err(stage_error(
                dest,
                "bind destination is not an existing directory",
            ));
        }

        tracing::debug!(
            source = %source.display(),
            dest = %dest.display(),
            "Binding mounted view"
        );

        mount_bind_recursive(source, dest).map_err(|e| stage_error(dest, e))?;

        // rbind,rslave: mounts propagate in, never back out. rustix calls
        // MS_SLAVE propagation DOWNSTREAM.
        if let Err(err) = mount_change(
            dest,
            MountPropagationFlags::DOWNSTREAM | MountPropagationFlags::REC,
        ) {
            if let Err(undo) = unmount(dest, UnmountFlags::empty()) {
                tracing::warn!(
                    dest = %dest.display(),
                    error = %undo,
                    "Could not undo bind after a failed propagation change"
                );
            }
            return Err(stage_error(dest, err));
        }

        tracing::info!(dest = %dest.display(), "Bind in place");
        Ok(())
    }

    fn unbind(&self, dest: &Path) -> MoorResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(dest = %dest.display(), "Removing bind");

        unmount(dest, UnmountFlags::empty()).map_err(|e| MoorError::UnmountFailed {
            target: dest.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl BindLinker for RecursiveBind {
    fn bind(&self, _source: &Path, _dest: &Path) -> MoorResult<()> {
        Err(MoorError::Unsupported {
            feature: "bind mounts".to_string(),
        })
    }

    fn unbind(&self, _dest: &Path) -> MoorResult<()> {
        Err(MoorError::Unsupported {
            feature: "bind mounts".to_string(),
        })
    }
}

fn stage_error(target: &Path, err: impl std::fmt::Display) -> MoorError {
    MoorError::StageFailed {
        stage: MountStage::Bind,
        target: target.to_path_buf(),
        message: err.to_string(),
    }
}
