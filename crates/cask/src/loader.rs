use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;

use crate::{
    asset::AssetRecord,
    files::Timestamp,
    path::{AssetPath, ParsePathError},
};

/// Package loader shared between registry and package objects.
pub type SharedPackageLoader = Arc<Mutex<dyn PackageLoader>>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read package file '{path}'. {error}")]
    Read {
        error: Arc<std::io::Error>,
        path: PathBuf,
    },

    #[error("Failed to parse package file '{path}'. {error}")]
    Parse {
        error: Arc<toml::de::Error>,
        path: PathBuf,
    },

    #[error("Package file '{path}' declares invalid object name '{name}'. {error}")]
    InvalidName {
        error: ParsePathError,
        name: String,
        path: PathBuf,
    },

    #[error("Package file '{path}' declares object '{name}' more than once")]
    DuplicateObject { name: String, path: PathBuf },

    #[error("Reading package file '{path}' was interrupted")]
    Interrupted { path: PathBuf },
}

/// Progress of a single object load request.
#[derive(Debug)]
pub enum LoadStatus {
    /// Still waiting for I/O.
    Pending,

    /// Object is loaded.
    Loaded(AssetRecord),

    /// Container has no such object.
    NotFound,

    Failed(LoadError),
}

/// Backend loading raw objects from one container.
///
/// Loaders must never block in any of these methods.
/// Asynchronous work progresses in [`PackageLoader::tick`].
pub trait PackageLoader: Send + 'static {
    /// Path of the package this loader is responsible for.
    fn package_path(&self) -> &AssetPath;

    /// Starts loading object at `path`.
    /// Returns loader-local request id,
    /// or `None` if the object can't be in this container.
    fn begin_load_object(&mut self, path: &AssetPath) -> Option<usize>;

    /// Checks progress of the request.
    /// Request is finished and its id is released once anything but
    /// [`LoadStatus::Pending`] is returned.
    fn try_finish_load_object(&mut self, request: usize) -> LoadStatus;

    /// Advances pending asynchronous work.
    fn tick(&mut self);

    /// Returns true if the container is an authoritative source file
    /// and not a cache file.
    fn is_source_package_file(&self) -> bool;

    /// Modification time of the container.
    /// Meaningful only for source package files.
    fn file_timestamp(&self) -> Timestamp;
}

/// Opens package loaders for containers.
pub trait PackageLoaderFactory: Send + Sync + 'static {
    /// Returns loader for the package at `package_path`
    /// or `None` if there's no container for it.
    fn open(&self, package_path: &AssetPath) -> Option<SharedPackageLoader>;
}

/// Wraps loader into shared handle.
pub fn share_loader<L>(loader: L) -> SharedPackageLoader
where
    L: PackageLoader,
{
    Arc::new(Mutex::new(loader))
}
