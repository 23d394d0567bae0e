//! Local image store.
//!
//! The store keeps an image index (reference -> layer stack) under the graph
//! root and per-image mount records (reference counts) under the run root.
//! Mount and unmount go through a pluggable [`GraphDriver`].

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use moor_common::{MoorError, MoorResult, StorePaths};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::driver::{GraphDriver, driver_by_name};
use crate::reference::ImageReference;

/// Options controlling where and how a store operates.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Graph and run roots.
    pub paths: StorePaths,
    /// Graph driver name.
    pub graph_driver: String,
}

impl StoreOptions {
    /// Detect sensible defaults for the calling user.
    ///
    /// Root gets the system-wide store; everyone else gets a per-user store
    /// under their home and runtime directories.
    #[must_use]
    pub fn auto_detect() -> Self {
        let paths = if running_as_root() {
            StorePaths::new()
        } else {
            StorePaths::rootless()
        };
        tracing::debug!(
            graph_root = %paths.graph_root.display(),
            run_root = %paths.run_root.display(),
            "Detected store roots"
        );
        Self {
            paths,
            graph_driver: String::from("overlay"),
        }
    }

    /// Replace the graph root.
    #[must_use]
    pub fn with_graph_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths.graph_root = root.into();
        self
    }

    /// Replace the run root.
    #[must_use]
    pub fn with_run_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths.run_root = root.into();
        self
    }

    /// Replace the graph driver.
    #[must_use]
    pub fn with_graph_driver(mut self, driver: impl Into<String>) -> Self {
        self.graph_driver = driver.into();
        self
    }
}

fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        rustix::process::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// A registered image in the graph root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Store-assigned image ID.
    pub id: String,
    /// Layer directories, bottom to top.
    pub layers: Vec<PathBuf>,
    /// When the image was registered.
    pub created: DateTime<Utc>,
}

/// Persisted mount state for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRecord {
    /// Active mount references.
    pub count: u32,
    /// Where the image is mounted.
    pub mountpoint: PathBuf,
    /// Driver that created the mount.
    pub driver: String,
    /// When the first reference appeared.
    pub since: DateTime<Utc>,
}

/// Mount operations the pipeline needs from an image store.
///
/// Implementations own reference counting: a successful
/// [`ImageStore::mount_image`] adds a reference and a successful
/// [`ImageStore::unmount_image`] drops one, tearing the mount down when the
/// count reaches zero.
pub trait ImageStore {
    /// Mount `reference` and return the read-only mountpoint.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::ImageNotFound`] for unregistered references and
    /// [`MoorError::StageFailed`] when the driver cannot mount the layers.
    fn mount_image(&self, reference: &ImageReference) -> MoorResult<PathBuf>;

    /// Drop one reference to `reference`'s mount and return the number of
    /// references that remain. With `force`, drop them all and unmount
    /// unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::NotMounted`] when no mount exists and
    /// [`MoorError::UnmountFailed`] when the mount cannot be released.
    fn unmount_image(&self, reference: &ImageReference, force: bool) -> MoorResult<u32>;

    /// Number of active mount references for `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::ImageNotFound`] for unregistered references.
    fn mounted_count(&self, reference: &ImageReference) -> MoorResult<u32>;

    /// Name of the graph driver backing this store.
    fn graph_driver(&self) -> &str;
}

/// Local image store backed by JSON metadata.
pub struct LocalStore {
    options: StoreOptions,
    driver: Box<dyn GraphDriver>,
    images: Mutex<HashMap<String, ImageRecord>>,
}

impl LocalStore {
    /// Open a store, creating its directory skeleton on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::StoreUnavailable`] when the roots cannot be
    /// created or the image index cannot be read, and [`MoorError::Config`]
    /// for an unknown graph driver.
    pub fn open(options: StoreOptions) -> MoorResult<Self> {
        let driver = driver_by_name(&options.graph_driver)?;

        options
            .paths
            .create_dirs()
            .map_err(|e| MoorError::StoreUnavailable {
                path: options.paths.graph_root.clone(),
                message: e.to_string(),
            })?;

        let images = Self::load_index(&options.paths)?;

        tracing::debug!(
            graph_root = %options.paths.graph_root.display(),
            run_root = %options.paths.run_root.display(),
            driver = driver.name(),
            images = images.len(),
            "Store opened"
        );

        Ok(Self {
            options,
            driver,
            images: Mutex::new(images),
        })
    }

    /// The roots this store operates on.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.options.paths
    }

    /// Register an image whose layer directories are already populated.
    ///
    /// Layer paths are ordered bottom to top. Registering an existing
    /// reference replaces its record.
    ///
    /// # Errors
    ///
    /// Fails when the layer stack is empty, a layer directory is missing, or
    /// the index cannot be written.
    pub fn record_image(
        &self,
        reference: &ImageReference,
        layers: Vec<PathBuf>,
    ) -> MoorResult<ImageRecord> {
        if layers.is_empty() {
            return Err(MoorError::Config {
                message: "an image needs at least one layer".to_string(),
            });
        }
        for layer in &layers {
            if !layer.is_dir() {
                return Err(MoorError::Config {
                    message: format!("layer directory {} does not exist", layer.display()),
                });
            }
        }

        let record = ImageRecord {
            id: moor_common::id::random_suffix(),
            layers,
            created: Utc::now(),
        };

        let mut images = self.images.lock();
        images.insert(reference.canonical(), record.clone());
        self.save_index(&images)?;

        tracing::info!(
            reference = %reference,
            id = %record.id,
            layers = record.layers.len(),
            "Image recorded"
        );
        Ok(record)
    }

    fn load_index(paths: &StorePaths) -> MoorResult<HashMap<String, ImageRecord>> {
        let path = paths.images_index();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| MoorError::StoreUnavailable {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| MoorError::StoreUnavailable {
            path,
            message: format!("corrupt image index: {e}"),
        })
    }

    fn save_index(&self, images: &HashMap<String, ImageRecord>) -> MoorResult<()> {
        let path = self.options.paths.images_index();
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_string_pretty(images)?)?;
        fs::rename(&staged, path)?;
        Ok(())
    }

    fn lookup(&self, reference: &ImageReference) -> MoorResult<ImageRecord> {
        self.images
            .lock()
            .get(&reference.canonical())
            .cloned()
            .ok_or_else(|| MoorError::ImageNotFound {
                reference: reference.canonical(),
            })
    }

    fn lock_mount_record(&self, image_id: &str) -> MoorResult<MountRecordLock> {
        MountRecordLock::acquire(self.options.paths.mount_lock(image_id))
    }

    fn load_mount_record(&self, image_id: &str) -> MoorResult<Option<MountRecord>> {
        let path = self.options.paths.mount_record(image_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save_mount_record(&self, image_id: &str, record: &MountRecord) -> MoorResult<()> {
        let path = self.options.paths.mount_record(image_id);
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_string_pretty(record)?)?;
        // mounted_count reads without the lock; rename keeps the file whole
        // for it.
        fs::rename(&staged, &path)?;
        Ok(())
    }

    fn clear_mount_record(&self, image_id: &str) -> MoorResult<()> {
        fs::remove_file(self.options.paths.mount_record(image_id))?;
        Ok(())
    }
}

/// Exclusive advisory lock over one image's mount record.
///
/// Every store instance, in this process or another, takes this lock before
/// reading or rewriting the record. The lock file persists so all openers
/// contend on the same inode; the kernel releases the lock when the handle
/// drops.
struct MountRecordLock {
    _file: fs::File,
}

impl MountRecordLock {
    fn acquire(path: PathBuf) -> MoorResult<Self> {
        use rustix::fs::{FlockOperation, flock};

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(|e| MoorError::Io(e.into()))?;
        Ok(Self { _file: file })
    }
}

impl ImageStore for LocalStore {
    fn mount_image(&self, reference: &ImageReference) -> MoorResult<PathBuf> {
        let image = self.lookup(reference)?;
        let _lock = self.lock_mount_record(&image.id)?;

        // Another reference to an already mounted image only bumps the count.
        if let Some(mut record) = self.load_mount_record(&image.id)? {
            record.count += 1;
            self.save_mount_record(&image.id, &record)?;
            tracing::debug!(
                reference = %reference,
                count = record.count,
                mountpoint = %record.mountpoint.display(),
                "Reusing existing mount"
            );
            return Ok(record.mountpoint);
        }

        let target = self.options.paths.mountpoint(&image.id);
        let mountpoint = self.driver.mount(&image.layers, &target)?;

        let record = MountRecord {
            count: 1,
            mountpoint: mountpoint.clone(),
            driver: self.driver.name().to_string(),
            since: Utc::now(),
        };
        if let Err(err) = self.save_mount_record(&image.id, &record) {
            if let Err(undo) = self.driver.unmount(&mountpoint, false) {
                tracing::warn!(
                    mountpoint = %mountpoint.display(),
                    error = %undo,
                    "Could not undo mount after a failed record write"
                );
            }
            return Err(err);
        }

        tracing::info!(
            reference = %reference,
            mountpoint = %mountpoint.display(),
            driver = self.driver.name(),
            "Image mounted"
        );
        Ok(mountpoint)
    }

    fn unmount_image(&self, reference: &ImageReference, force: bool) -> MoorResult<u32> {
        let image = self.lookup(reference)?;
        let _lock = self.lock_mount_record(&image.id)?;

        let Some(mut record) = self.load_mount_record(&image.id)? else {
            return Err(MoorError::NotMounted {
                reference: reference.canonical(),
            });
        };

        if !force && record.count > 1 {
            record.count -= 1;
            self.save_mount_record(&image.id, &record)?;
            tracing::debug!(
                reference = %reference,
                count = record.count,
                "Dropped one mount reference"
            );
            return Ok(record.count);
        }

        // Release through the driver named in the record, not the one this
        // store was opened with.
        let driver = driver_by_name(&record.driver)?;
        driver.unmount(&record.mountpoint, force)?;
        self.clear_mount_record(&image.id)?;

        tracing::info!(reference = %reference, forced = force, "Image unmounted");
        Ok(0)
    }

    fn mounted_count(&self, reference: &ImageReference) -> MoorResult<u32> {
        let image = self.lookup(reference)?;
        Ok(self
            .load_mount_record(&image.id)?
            .map_or(0, |record| record.count))
    }

    fn graph_driver(&self) -> &str {
        self.driver.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &std::path::Path) -> LocalStore {
        let options = StoreOptions {
            paths: StorePaths::with_roots(dir.join("graph"), dir.join("run")),
            graph_driver: "vfs".to_string(),
        };
        LocalStore::open(options).unwrap()
    }

    fn seed_image(store: &LocalStore, dir: &std::path::Path, name: &str) -> ImageReference {
        let layer = dir.join(format!("{name}-layer"));
        fs::create_dir_all(&layer).unwrap();
        let reference = ImageReference::parse(name).unwrap();
        store.record_image(&reference, vec![layer]).unwrap();
        reference
    }

    #[test_log::test]
    fn mount_counts_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let reference = seed_image(&store, dir.path(), "alpine");

        assert_eq!(store.mounted_count(&reference).unwrap(), 0);
        let first = store.mount_image(&reference).unwrap();
        let second = store.mount_image(&reference).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.mounted_count(&reference).unwrap(), 2);

        assert_eq!(store.unmount_image(&reference, false).unwrap(), 1);
        assert_eq!(store.unmount_image(&reference, false).unwrap(), 0);
        assert_eq!(store.mounted_count(&reference).unwrap(), 0);
    }

    #[test]
    fn force_unmount_drops_all_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let reference = seed_image(&store, dir.path(), "busybox");

        for _ in 0..3 {
            store.mount_image(&reference).unwrap();
        }
        assert_eq!(store.unmount_image(&reference, true).unwrap(), 0);
        assert_eq!(store.mounted_count(&reference).unwrap(), 0);
    }

    #[test]
    fn unmount_uses_the_recorded_driver() {
        let dir = tempfile::tempdir().unwrap();
        let reference = {
            let store = test_store(dir.path());
            let reference = seed_image(&store, dir.path(), "alpine");
            store.mount_image(&reference).unwrap();
            reference
        };

        // A store reopened under another driver still releases the mount
        // through the driver named in the record.
        let options = StoreOptions {
            paths: StorePaths::with_roots(dir.path().join("graph"), dir.path().join("run")),
            graph_driver: "overlay".to_string(),
        };
        let store = LocalStore::open(options).unwrap();
        assert_eq!(store.unmount_image(&reference, false).unwrap(), 0);
    }

    #[test]
    fn concurrent_stores_agree_on_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let reference = {
            let store = test_store(dir.path());
            seed_image(&store, dir.path(), "alpine")
        };

        // Every thread opens its own store, the way separate processes do.
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let root = dir.path().to_path_buf();
                let reference = reference.clone();
                std::thread::spawn(move || {
                    let store = test_store(&root);
                    for _ in 0..25 {
                        store.mount_image(&reference).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let store = test_store(dir.path());
        assert_eq!(store.mounted_count(&reference).unwrap(), 100);
        assert_eq!(store.unmount_image(&reference, true).unwrap(), 0);
    }

    #[test]
    fn unmount_without_mount_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let reference = seed_image(&store, dir.path(), "alpine");

        assert!(matches!(
            store.unmount_image(&reference, false),
            Err(MoorError::NotMounted { .. })
        ));
    }

    #[test]
    fn unknown_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let reference = ImageReference::parse("nosuch").unwrap();

        assert!(matches!(
            store.mount_image(&reference),
            Err(MoorError::ImageNotFound { .. })
        ));
        assert!(matches!(
            store.mounted_count(&reference),
            Err(MoorError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn record_requires_existing_layers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let reference = ImageReference::parse("broken").unwrap();

        assert!(store.record_image(&reference, Vec::new()).is_err());
        assert!(
            store
                .record_image(&reference, vec![dir.path().join("missing")])
                .is_err()
        );
    }

    #[test_log::test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let reference = {
            let store = test_store(dir.path());
            seed_image(&store, dir.path(), "alpine")
        };

        let store = test_store(dir.path());
        let mountpoint = store.mount_image(&reference).unwrap();
        assert!(mountpoint.is_dir());
        store.unmount_image(&reference, false).unwrap();
    }

    #[test]
    fn open_fails_when_root_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let options = StoreOptions {
            paths: StorePaths::with_roots(blocker.join("graph"), dir.path().join("run")),
            graph_driver: "vfs".to_string(),
        };
        assert!(matches!(
            LocalStore::open(options),
            Err(MoorError::StoreUnavailable { .. })
        ));
    }
}
