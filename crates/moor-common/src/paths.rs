//! Standard filesystem paths for the moor store.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default graph root where image metadata and layers live.
pub static MOOR_GRAPH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MOOR_GRAPH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/moor"))
});

/// Default run root where per-boot mount state lives.
pub static MOOR_RUN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MOOR_RUN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/moor"))
});

/// Store roots used by the moor store and mount pipeline.
#[derive(Debug, Clone)]
pub struct StorePaths {
    /// Graph root holding the image index and layer directories.
    pub graph_root: PathBuf,
    /// Run root holding mount records and mountpoints.
    pub run_root: PathBuf,
}

impl StorePaths {
    /// Create paths with the default (root-owned) locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with explicit graph and run roots.
    #[must_use]
    pub fn with_roots(graph_root: impl Into<PathBuf>, run_root: impl Into<PathBuf>) -> Self {
        Self {
            graph_root: graph_root.into(),
            run_root: run_root.into(),
        }
    }

    /// Create paths under the calling user's home and runtime directories.
    ///
    /// Used when the process is not running as root.
    #[must_use]
    pub fn rootless() -> Self {
        let graph_root = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("moor");
        let run_root = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("moor");
        Self {
            graph_root,
            run_root,
        }
    }

    /// The image index file.
    #[must_use]
    pub fn images_index(&self) -> PathBuf {
        self.graph_root.join("images.json")
    }

    /// Directory for extracted layers.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.graph_root.join("layers")
    }

    /// Layer directory by ID.
    #[must_use]
    pub fn layer(&self, id: &str) -> PathBuf {
        self.layers().join(id)
    }

    /// Directory for active mount state.
    #[must_use]
    pub fn mounts(&self) -> PathBuf {
        self.run_root.join("mounts")
    }

    /// Mount record file for an image.
    #[must_use]
    pub fn mount_record(&self, image_id: &str) -> PathBuf {
        self.mounts().join(format!("{image_id}.json"))
    }

    /// Lock file guarding an image's mount record.
    #[must_use]
    pub fn mount_lock(&self, image_id: &str) -> PathBuf {
        self.mounts().join(format!("{image_id}.lock"))
    }

    /// Mountpoint directory for an image.
    #[must_use]
    pub fn mountpoint(&self, image_id: &str) -> PathBuf {
        self.mounts().join(image_id).join("merged")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.graph_root)?;
        std::fs::create_dir_all(&self.run_root)?;
        std::fs::create_dir_all(self.layers())?;
        std::fs::create_dir_all(self.mounts())?;
        Ok(())
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            graph_root: MOOR_GRAPH_ROOT.clone(),
            run_root: MOOR_RUN_ROOT.clone(),
        }
    }
}
