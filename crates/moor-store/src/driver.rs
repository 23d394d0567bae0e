//! Graph drivers.
//!
//! A graph driver materializes an image's layer stack as a mountable
//! directory tree. The overlay driver composes layers with a read-only
//! overlayfs mount; the vfs driver serves a pre-flattened top layer directly
//! and performs no mount syscalls, so it works without privileges.

use std::path::{Path, PathBuf};

use moor_common::{MoorError, MoorResult, MountStage};

/// Materializes image layer stacks as mountable trees.
///
/// Layer slices are ordered bottom to top everywhere in this crate.
pub trait GraphDriver {
    /// Driver name as selected by `--storage-driver`.
    fn name(&self) -> &'static str;

    /// Make `layers` visible at `target` and return the path callers read
    /// the image through.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::StageFailed`] when the layer stack cannot be
    /// composed or mounted.
    fn mount(&self, layers: &[PathBuf], target: &Path) -> MoorResult<PathBuf>;

    /// Tear down a mount previously created at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::UnmountFailed`] when the kernel refuses to
    /// release the mount.
    fn unmount(&self, target: &Path, force: bool) -> MoorResult<()>;
}

/// Kernel overlayfs driver.
///
/// Multi-layer images become a read-only overlay with no upper directory.
/// Single-layer images are recursively bind-mounted instead, since overlayfs
/// refuses a lone lowerdir without an upper.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayDriver;

#[cfg(target_os = "linux")]
impl OverlayDriver {
    fn bind_single(layer: &Path, target: &Path) -> MoorResult<()> {
        use rustix::mount::mount_bind_recursive;

        tracing::debug!(
            source = %layer.display(),
            target = %target.display(),
            "Single layer, using a recursive bind"
        );
        mount_bind_recursive(layer, target).map_err(|e| stage_error(target, e))
    }

    fn compose(layers: &[PathBuf], target: &Path) -> MoorResult<()> {
        use rustix::mount::{MountFlags, mount};
        use std::ffi::CString;

        // overlayfs lists the uppermost layer first
        let lowerdir = layers
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!("lowerdir={lowerdir}");

        tracing::debug!(
            target = %target.display(),
            options = %options,
            "Mounting read-only overlay"
        );

        let options_c = CString::new(options).map_err(|e| stage_error(target, e))?;
        mount(
            "overlay",
            target,
            "overlay",
            MountFlags::RDONLY,
            options_c.as_c_str(),
        )
        .map_err(|e| stage_error(target, e))
    }
}

#[cfg(target_os = "linux")]
impl GraphDriver for OverlayDriver {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn mount(&self, layers: &[PathBuf], target: &Path) -> MoorResult<PathBuf> {
        let Some((top, rest)) = layers.split_last() else {
            return Err(MoorError::Internal {
                message: "image has no layers".to_string(),
            });
        };

        std::fs::create_dir_all(target).map_err(|e| stage_error(target, e))?;

        let mounted = if rest.is_empty() {
            Self::bind_single(top, target)
        } else {
            Self::compose(layers, target)
        };
        if let Err(err) = mounted {
            // remove_dir only, the directory must still be empty here.
            let _ = std::fs::remove_dir(target);
            return Err(err);
        }

        Ok(target.to_path_buf())
    }

    fn unmount(&self, target: &Path, force: bool) -> MoorResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        let mut flags = UnmountFlags::empty();
        if force {
            flags |= UnmountFlags::FORCE;
        }

        tracing::debug!(target = %target.display(), force, "Unmounting image tree");

        unmount(target, flags).map_err(|e| MoorError::UnmountFailed {
            target: target.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl GraphDriver for OverlayDriver {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn mount(&self, _layers: &[PathBuf], _target: &Path) -> MoorResult<PathBuf> {
        Err(MoorError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    fn unmount(&self, _target: &Path, _force: bool) -> MoorResult<()> {
        Err(MoorError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }
}

/// Driver that serves the top layer directory as-is.
///
/// Only correct for images whose top layer is a full flattened tree, which
/// is exactly what a vfs-style store writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VfsDriver;

impl GraphDriver for VfsDriver {
    fn name(&self) -> &'static str {
        "vfs"
    }

    fn mount(&self, layers: &[PathBuf], _target: &Path) -> MoorResult<PathBuf> {
        let Some(top) = layers.last() else {
            return Err(MoorError::Internal {
                message: "image has no layers".to_string(),
            });
        };
        if !top.is_dir() {
            return Err(stage_error(top, "top layer directory does not exist"));
        }
        tracing::debug!(layer = %top.display(), "Serving top layer directly");
        Ok(top.clone())
    }

    fn unmount(&self, target: &Path, _force: bool) -> MoorResult<()> {
        tracing::debug!(target = %target.display(), "No kernel mount to release");
        Ok(())
    }
}

/// Look up a driver by its CLI name.
///
/// # Errors
///
/// Returns [`MoorError::Config`] for unknown driver names.
pub fn driver_by_name(name: &str) -> MoorResult<Box<dyn GraphDriver>> {
    match name {
        "overlay" => Ok(Box::new(OverlayDriver)),
        "vfs" => Ok(Box::new(VfsDriver)),
        other => Err(MoorError::Config {
            message: format!("unknown storage driver '{other}' (expected overlay or vfs)"),
        }),
    }
}

fn stage_error(target: &Path, err: impl std::fmt::Display) -> MoorError {
    MoorError::StageFailed {
        stage: MountStage::Image,
        target: target.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_lookup() {
        assert_eq!(driver_by_name("overlay").unwrap().name(), "overlay");
        assert_eq!(driver_by_name("vfs").unwrap().name(), "vfs");
        assert!(matches!(
            driver_by_name("aufs"),
            Err(MoorError::Config { .. })
        ));
    }

    #[test]
    fn vfs_serves_top_layer() {
        let dir = tempfile::tempdir().unwrap();
        let bottom = dir.path().join("bottom");
        let top = dir.path().join("top");
        std::fs::create_dir_all(&bottom).unwrap();
        std::fs::create_dir_all(&top).unwrap();

        let mounted = VfsDriver
            .mount(&[bottom, top.clone()], &dir.path().join("unused"))
            .unwrap();
        assert_eq!(mounted, top);
        VfsDriver.unmount(&mounted, false).unwrap();
    }

    #[test]
    fn vfs_rejects_missing_layer() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = VfsDriver
            .mount(std::slice::from_ref(&missing), &dir.path().join("unused"))
            .unwrap_err();
        assert!(matches!(err, MoorError::StageFailed { .. }));
    }

    #[test]
    fn empty_layer_stack_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VfsDriver.mount(&[], &dir.path().join("unused")),
            Err(MoorError::Internal { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test_log::test]
    fn overlay_mount_failure_is_stage_error() {
        // Missing lowerdirs make the mount fail for root (ENOENT) and
        // non-root (EPERM) alike.
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![dir.path().join("gone-1"), dir.path().join("gone-2")];
        let target = dir.path().join("target");
        let err = OverlayDriver.mount(&layers, &target).unwrap_err();
        assert!(matches!(
            err,
            MoorError::StageFailed {
                stage: MountStage::Image,
                ..
            }
        ));
        assert!(!target.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn single_layer_bind_failure_is_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![dir.path().join("gone")];
        let target = dir.path().join("target");
        let err = OverlayDriver.mount(&layers, &target).unwrap_err();
        assert!(matches!(err, MoorError::StageFailed { .. }));
        assert!(!target.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn overlay_options_reject_interior_nul() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![PathBuf::from("/lower\0dir"), dir.path().join("top")];
        let target = dir.path().join("target");
        let err = OverlayDriver.mount(&layers, &target).unwrap_err();
        assert!(matches!(err, MoorError::StageFailed { .. }));
        assert!(!target.exists());
    }
}
