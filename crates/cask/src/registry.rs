use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    loader::{PackageLoaderFactory, SharedPackageLoader},
    path::AssetPath,
};

/// Maps packages to their loaders.
///
/// Loaders are created lazily on first reference to any path in their container.
pub struct PackageLoaderMap {
    factory: Box<dyn PackageLoaderFactory>,
    loaders: Mutex<HashMap<AssetPath, SharedPackageLoader>>,
}

impl PackageLoaderMap {
    pub fn new(factory: Box<dyn PackageLoaderFactory>) -> Self {
        PackageLoaderMap {
            factory,
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Returns loader of the innermost container at or above `path`.
    ///
    /// Creates the loader if it doesn't exist yet.
    /// Returns `None` if no container exists for the path.
    pub fn get_package_loader(&self, path: &AssetPath) -> Option<SharedPackageLoader> {
        // Lock is held while opening so that the same container is never opened twice.
        let mut loaders = self.loaders.lock();

        for package_path in path.package_path().ancestors() {
            if let Some(loader) = loaders.get(&package_path) {
                return Some(loader.clone());
            }

            if let Some(loader) = self.factory.open(&package_path) {
                tracing::debug!("Opened package loader for '{}'", package_path);
                loaders.insert(package_path, loader.clone());
                return Some(loader);
            }
        }

        None
    }

    /// Gives every live loader a chance to make progress.
    pub fn tick_package_loaders(&self) {
        let loaders: Vec<SharedPackageLoader> = self.loaders.lock().values().cloned().collect();

        for loader in loaders {
            loader.lock().tick();
        }
    }

    pub fn len(&self) -> usize {
        self.loaders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.lock().is_empty()
    }
}
