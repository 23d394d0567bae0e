//! Writable overlay setup over a read-only image tree.

use std::path::{Path, PathBuf};

use moor_common::{MoorError, MoorResult, MountStage};

/// A writable overlay workspace.
///
/// One workspace backs exactly one overlay mount: `merge` is the mountpoint,
/// `upper` collects the writes, and `work` is overlayfs scratch space. All
/// three live under a uniquely named `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayWorkspace {
    /// Workspace directory holding the three subdirectories.
    pub root: PathBuf,
    /// Where the overlay is mounted.
    pub merge: PathBuf,
    /// Writable upper directory.
    pub upper: PathBuf,
    /// Overlayfs scratch directory.
    pub work: PathBuf,
}

impl OverlayWorkspace {
    /// Create a fresh workspace under `parent` with a unique name.
    ///
    /// Creation is all or nothing: when one of the directories cannot be
    /// created, the partially built tree is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::StageFailed`] when the directories cannot be
    /// created.
    pub fn create(parent: &Path) -> MoorResult<Self> {
        Self::create_at(parent.join(moor_common::id::unique_name("moor-overlay")))
    }

    fn create_at(root: PathBuf) -> MoorResult<Self> {
        let workspace = Self {
            merge: root.join("merge"),
            upper: root.join("upper"),
            work: root.join("work"),
            root,
        };
        if let Err(err) = workspace.create_dirs() {
            let err = stage_error(&workspace.root, err);
            workspace.discard();
            return Err(err);
        }
        Ok(workspace)
    }

    /// Rebuild a workspace from its merge directory, for tearing down a
    /// mount created by an earlier invocation.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::Config`] when `merge` does not sit inside a
    /// workspace with `upper` and `work` directories beside it.
    pub fn from_merge(merge: &Path) -> MoorResult<Self> {
        if !merge.ends_with("merge") {
            return Err(MoorError::Config {
                message: format!(
                    "{} does not look like an overlay merge directory",
                    merge.display()
                ),
            });
        }
        let root = merge
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| MoorError::Config {
                message: format!("{} has no parent workspace", merge.display()),
            })?;
        let workspace = Self {
            root: root.to_path_buf(),
            merge: root.join("merge"),
            upper: root.join("upper"),
            work: root.join("work"),
        };
        if !workspace.upper.is_dir() || !workspace.work.is_dir() {
            return Err(MoorError::Config {
                message: format!(
                    "{} has no upper/work directories beside it",
                    merge.display()
                ),
            });
        }
        Ok(workspace)
    }

    /// The overlayfs options string for mounting over `lower`.
    #[must_use]
    pub fn mount_options(&self, lower: &Path) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.merge)?;
        std::fs::create_dir_all(&self.upper)?;
        std::fs::create_dir_all(&self.work)?;
        Ok(())
    }

    /// Remove the workspace tree, logging instead of failing.
    fn discard(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    workspace = %self.root.display(),
                    error = %err,
                    "Could not remove overlay workspace"
                );
            }
        }
    }
}

/// Builds and tears down writable overlays above a read-only tree.
pub trait OverlayManager {
    /// Stack a writable overlay over `lower` and return its workspace. The
    /// workspace's `merge` directory is the writable view.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::StageFailed`] when the workspace cannot be
    /// built or the overlay cannot be mounted; a failed mount leaves no
    /// workspace behind.
    fn mount(&self, lower: &Path) -> MoorResult<OverlayWorkspace>;

    /// Unmount the overlay and discard its workspace.
    ///
    /// The workspace is only removed once the unmount went through; an
    /// unmount error leaves it untouched on disk.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::UnmountFailed`] when the overlay stays mounted.
    fn unmount(&self, workspace: &OverlayWorkspace) -> MoorResult<()>;
}

/// Overlay manager backed by kernel overlayfs.
#[derive(Debug, Clone)]
pub struct OverlayFs {
    workspace_parent: PathBuf,
}

impl OverlayFs {
    /// Manager that creates workspaces under `parent`.
    #[must_use]
    pub fn new(parent: impl Into<PathBuf>) -> Self {
        Self {
            workspace_parent: parent.into(),
        }
    }
}

impl Default for OverlayFs {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[cfg(target_os = "linux")]
impl OverlayFs {
    fn mount_at(workspace: &OverlayWorkspace, options: String) -> MoorResult<()> {
        use rustix::mount::{MountFlags, mount};
        use std::ffi::CString;

        let options_c = CString::new(options).map_err(|e| stage_error(&workspace.merge, e))?;
        mount(
            "overlay",
            &workspace.merge,
            "overlay",
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| stage_error(&workspace.merge, e))
    }
}

#[cfg(target_os = "linux")]
impl OverlayManager for OverlayFs {
    fn mount(&self, lower: &Path) -> MoorResult<OverlayWorkspace> {
        let workspace = OverlayWorkspace::create(&self.workspace_parent)?;
        let options = workspace.mount_options(lower);

        tracing::debug!(
            merge = %workspace.merge.display(),
            options = %options,
            "Mounting writable overlay"
        );

        if let Err(err) = Self::mount_at(&workspace, options) {
            workspace.discard();
            return Err(err);
        }

        tracing::info!(merge = %workspace.merge.display(), "Overlay mounted");
        Ok(workspace)
    }

    fn unmount(&self, workspace: &OverlayWorkspace) -> MoorResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(merge = %workspace.merge.display(), "Unmounting overlay");

        unmount(&workspace.merge, UnmountFlags::empty()).map_err(|e| {
            MoorError::UnmountFailed {
                target: workspace.merge.clone(),
                message: e.to_string(),
            }
        })?;

        workspace.discard();
        tracing::info!(merge = %workspace.merge.display(), "Overlay unmounted");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl OverlayManager for OverlayFs {
    fn mount(&self, _lower: &Path) -> MoorResult<OverlayWorkspace> {
        Err(MoorError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    fn unmount(&self, _workspace: &OverlayWorkspace) -> MoorResult<()> {
        Err(MoorError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }
}

fn stage_error(target: &Path, err: impl std::fmt::Display) -> MoorError {
    MoorError::StageFailed {
        stage: MountStage::Overlay,
        target: target.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn workspace_layout() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = OverlayWorkspace::create(dir.path()).unwrap();

        assert!(workspace.root.starts_with(dir.path()));
        assert!(workspace.merge.is_dir());
        assert!(workspace.upper.is_dir());
        assert!(workspace.work.is_dir());

        let name = workspace.root.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("moor-overlay-"));
    }

    #[test]
    fn workspace_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let first = OverlayWorkspace::create(dir.path()).unwrap();
        let second = OverlayWorkspace::create(dir.path()).unwrap();
        assert_ne!(first.root, second.root);
    }

    #[test_log::test]
    fn workspace_creation_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();
        // A file where the merge directory should go blocks creation.
        std::fs::write(root.join("merge"), b"blocked").unwrap();

        let err = OverlayWorkspace::create_at(root.clone()).unwrap_err();
        assert!(matches!(
            err,
            MoorError::StageFailed {
                stage: MountStage::Overlay,
                ..
            }
        ));
        assert!(!root.exists());
    }

    #[test]
    fn mount_options_format() {
        let workspace = OverlayWorkspace {
            root: PathBuf::from("/ws"),
            merge: PathBuf::from("/ws/merge"),
            upper: PathBuf::from("/ws/upper"),
            work: PathBuf::from("/ws/work"),
        };
        assert_eq!(
            workspace.mount_options(Path::new("/lower")),
            "lowerdir=/lower,upperdir=/ws/upper,workdir=/ws/work"
        );
    }

    #[test]
    fn from_merge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = OverlayWorkspace::create(dir.path()).unwrap();
        let rebuilt = OverlayWorkspace::from_merge(&workspace.merge).unwrap();
        assert_eq!(rebuilt, workspace);
    }

    #[test]
    fn from_merge_rejects_other_paths() {
        assert!(matches!(
            OverlayWorkspace::from_merge(Path::new("/tmp/somewhere")),
            Err(MoorError::Config { .. })
        ));
        // A bare relative merge has no workspace around it.
        assert!(matches!(
            OverlayWorkspace::from_merge(Path::new("merge")),
            Err(MoorError::Config { .. })
        ));
    }

    #[test]
    fn from_merge_rejects_a_lone_merge_directory() {
        let dir = tempfile::tempdir().unwrap();
        let merge = dir.path().join("merge");
        std::fs::create_dir_all(&merge).unwrap();

        assert!(matches!(
            OverlayWorkspace::from_merge(&merge),
            Err(MoorError::Config { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test_log::test]
    fn failed_mount_leaves_no_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OverlayFs::new(dir.path());

        // A missing lowerdir fails the mount for root and non-root alike.
        let err = manager.mount(&dir.path().join("missing-lower")).unwrap_err();
        assert!(matches!(
            err,
            MoorError::StageFailed {
                stage: MountStage::Overlay,
                ..
            }
        ));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn nul_in_lower_path_leaves_no_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OverlayFs::new(dir.path());

        let err = manager.mount(Path::new("/lower\0dir")).unwrap_err();
        assert!(matches!(
            err,
            MoorError::StageFailed {
                stage: MountStage::Overlay,
                ..
            }
        ));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
