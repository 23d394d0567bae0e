//! Common error types for the moor ecosystem.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`MoorError`].
pub type MoorResult<T> = Result<T, MoorError>;

/// The mount pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    /// Mounting the image through the store's graph driver.
    Image,
    /// Building and mounting the writable overlay.
    Overlay,
    /// Bind-linking the mounted tree to a caller-provided destination.
    Bind,
}

impl std::fmt::Display for MountStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Overlay => "overlay",
            Self::Bind => "bind",
        };
        f.write_str(name)
    }
}

/// Common errors across the moor ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum MoorError {
    /// The backing store could not be opened or initialized.
    #[error("Store unavailable at {}: {message}", path.display())]
    #[diagnostic(
        code(moor::store::unavailable),
        help(
            "Check permissions on the store roots, pass --graph/--run, or retry inside `moor unshare`"
        )
    )]
    StoreUnavailable {
        /// The graph root that could not be opened.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// An image reference failed validation.
    #[error("Invalid image reference '{reference}': {message}")]
    #[diagnostic(
        code(moor::reference::invalid),
        help("References look like [registry/]name[:tag] or name@sha256:<hex>")
    )]
    InvalidReference {
        /// The offending reference.
        reference: String,
        /// Why it was rejected.
        message: String,
    },

    /// Image not found in the store.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(moor::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// A mount pipeline stage failed to come up.
    #[error("Mount stage {stage} failed at {}: {message}", target.display())]
    #[diagnostic(code(moor::mount::stage_failed))]
    StageFailed {
        /// The stage that failed.
        stage: MountStage,
        /// The path the stage was operating on.
        target: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// The image has no active mounts to unmount.
    #[error("Image not mounted: {reference}")]
    #[diagnostic(code(moor::mount::not_mounted))]
    NotMounted {
        /// The image reference.
        reference: String,
    },

    /// A mounted filesystem could not be detached.
    #[error("Failed to unmount {}: {message}", target.display())]
    #[diagnostic(
        code(moor::mount::unmount_failed),
        help("The mountpoint may be busy; retry with --force to detach it anyway")
    )]
    UnmountFailed {
        /// The mountpoint that stayed mounted.
        target: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(moor::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(moor::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(moor::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(moor::unsupported),
        help("Mount and namespace operations require Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(moor::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/moor/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for MoorError {
    fn from(err: serde_json::Error) -> Self {
        MoorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MoorError::ImageNotFound {
            reference: "docker.io/library/alpine:latest".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Image not found: docker.io/library/alpine:latest"
        );
    }

    #[test]
    fn stage_failed_display() {
        let err = MoorError::StageFailed {
            stage: MountStage::Overlay,
            target: PathBuf::from("/tmp/moor-abc/merge"),
            message: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Mount stage overlay failed at /tmp/moor-abc/merge: permission denied"
        );
    }

    #[test]
    fn stage_labels() {
        assert_eq!(MountStage::Image.to_string(), "image");
        assert_eq!(MountStage::Overlay.to_string(), "overlay");
        assert_eq!(MountStage::Bind.to_string(), "bind");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MoorError = io_err.into();
        assert!(matches!(err, MoorError::Io(_)));
    }
}
