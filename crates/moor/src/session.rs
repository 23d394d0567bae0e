//! Staged mount orchestration with rollback.
//!
//! A mount runs up to three stages in order: the image mount from the
//! store, an optional writable overlay, and an optional bind to a
//! caller-chosen destination. When a stage fails, every stage that
//! already completed is undone again, newest first, and the stage's
//! error is returned unchanged.

use std::path::{Path, PathBuf};

use moor_common::{MoorError, MoorResult};
use moor_store::{ImageReference, ImageStore};

use crate::filesystem::{BindLinker, OverlayManager, OverlayWorkspace};

/// What to mount and how far to take it.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// Image to mount.
    pub reference: ImageReference,
    /// Stack a writable overlay on top of the image.
    pub overlay: bool,
    /// Bind the final view to this directory.
    pub bind: Option<PathBuf>,
}

/// What to unmount, mirroring an earlier [`MountRequest`].
#[derive(Debug, Clone)]
pub struct UnmountRequest {
    /// Image to release.
    pub reference: ImageReference,
    /// Merge directory of the overlay to tear down.
    pub overlay: Option<PathBuf>,
    /// Bind destination to remove.
    pub bind: Option<PathBuf>,
    /// Release every reference the store holds, not just this one.
    pub force: bool,
}

/// A completed stage, recorded so it can be undone.
enum Stage {
    Image { reference: ImageReference },
    Overlay { workspace: OverlayWorkspace },
    Bind { dest: PathBuf },
}

/// The paths a successful mount produced.
#[derive(Debug, Clone)]
pub struct MountOutcome {
    /// Read-only root of the mounted image.
    pub image_root: PathBuf,
    /// Merge directory of the overlay, when one was requested.
    pub overlay_merge: Option<PathBuf>,
    /// Bind destination, when one was requested.
    pub bind_dest: Option<PathBuf>,
}

impl MountOutcome {
    /// The outermost view of the mount, the path a caller works in.
    #[must_use]
    pub fn view(&self) -> &Path {
        self.bind_dest
            .as_deref()
            .or(self.overlay_merge.as_deref())
            .unwrap_or(&self.image_root)
    }

    /// Every produced path in stage order.
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.image_root.as_path()];
        if let Some(merge) = self.overlay_merge.as_deref() {
            paths.push(merge);
        }
        if let Some(dest) = self.bind_dest.as_deref() {
            paths.push(dest);
        }
        paths
    }
}

/// Runs mount and unmount requests against a store and the filesystem
/// stages.
pub struct MountSession<'a> {
    store: &'a dyn ImageStore,
    overlay: &'a dyn OverlayManager,
    bind: &'a dyn BindLinker,
}

impl<'a> MountSession<'a> {
    /// A session over the given store and stage backends.
    pub fn new(
        store: &'a dyn ImageStore,
        overlay: &'a dyn OverlayManager,
        bind: &'a dyn BindLinker,
    ) -> Self {
        Self {
            store,
            overlay,
            bind,
        }
    }

    /// Mount an image, with the requested overlay and bind stages on top.
    ///
    /// # Errors
    ///
    /// Returns the failing stage's error after undoing the stages that
    /// already completed, newest first.
    pub fn mount(&self, request: &MountRequest) -> MoorResult<MountOutcome> {
        tracing::debug!(driver = self.store.graph_driver(), "Mount session starting");
        self.log_existing_mounts(&request.reference);

        let mut completed = Vec::new();
        match self.stage_all(request, &mut completed) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.rollback(completed);
                Err(err)
            }
        }
    }

    fn stage_all(
        &self,
        request: &MountRequest,
        completed: &mut Vec<Stage>,
    ) -> MoorResult<MountOutcome> {
        let image_root = self.store.mount_image(&request.reference)?;
        completed.push(Stage::Image {
            reference: request.reference.clone(),
        });
        tracing::debug!(root = %image_root.display(), "Image stage complete");

        let mut view = image_root.clone();
        let mut overlay_merge = None;
        if request.overlay {
            let workspace = self.overlay.mount(&view)?;
            view = workspace.merge.clone();
            overlay_merge = Some(workspace.merge.clone());
            completed.push(Stage::Overlay { workspace });
        }

        if let Some(dest) = &request.bind {
            self.bind.bind(&view, dest)?;
            completed.push(Stage::Bind { dest: dest.clone() });
        }

        Ok(MountOutcome {
            image_root,
            overlay_merge,
            bind_dest: request.bind.clone(),
        })
    }

    /// Undo completed stages newest first. Failures are logged and the
    /// remaining stages are still attempted.
    fn rollback(&self, completed: Vec<Stage>) {
        for stage in completed.into_iter().rev() {
            match stage {
                Stage::Bind { dest } => {
                    if let Err(err) = self.bind.unbind(&dest) {
                        tracing::warn!(
                            dest = %dest.display(),
                            error = %err,
                            "Rollback could not remove bind"
                        );
                    }
                }
                Stage::Overlay { workspace } => {
                    if let Err(err) = self.overlay.unmount(&workspace) {
                        tracing::warn!(
                            merge = %workspace.merge.display(),
                            error = %err,
                            "Rollback could not unmount overlay"
                        );
                    }
                }
                Stage::Image { reference } => {
                    // Only this invocation's reference is given back; other
                    // holders of the image keep theirs.
                    if let Err(err) = self.store.unmount_image(&reference, false) {
                        tracing::warn!(
                            reference = %reference,
                            error = %err,
                            "Rollback could not release image"
                        );
                    }
                }
            }
        }
    }

    fn log_existing_mounts(&self, reference: &ImageReference) {
        if !tracing::enabled!(tracing::Level::INFO) {
            return;
        }
        match self.store.mounted_count(reference) {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(reference = %reference, count, "Image already mounted");
            }
            Err(err) => {
                tracing::warn!(
                    reference = %reference,
                    error = %err,
                    "Could not check existing mounts"
                );
            }
        }
    }

    /// Unmount the stages of an earlier mount, outermost first.
    ///
    /// Every requested step is attempted even when an earlier one fails;
    /// the first error encountered is the one returned.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn unmount(&self, request: &UnmountRequest) -> MoorResult<()> {
        let mut first_error: Option<MoorError> = None;

        if let Some(dest) = &request.bind {
            if let Err(err) = self.bind.unbind(dest) {
                tracing::warn!(dest = %dest.display(), error = %err, "Bind removal failed");
                first_error.get_or_insert(err);
            }
        }

        if let Some(merge) = &request.overlay {
            if let Err(err) = self.unmount_overlay_at(merge) {
                tracing::warn!(merge = %merge.display(), error = %err, "Overlay teardown failed");
                first_error.get_or_insert(err);
            }
        }

        match self.store.unmount_image(&request.reference, request.force) {
            Ok(remaining) => {
                tracing::info!(reference = %request.reference, remaining, "Image released");
            }
            Err(err) => {
                tracing::warn!(
                    reference = %request.reference,
                    error = %err,
                    "Image release failed"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn unmount_overlay_at(&self, merge: &Path) -> MoorResult<()> {
        let workspace = OverlayWorkspace::from_merge(merge)?;
        self.overlay.unmount(&workspace)
    }
}
