use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::path::AssetPath;

/// File modification time in milliseconds since UNIX epoch.
///
/// Freshness of cached objects is expressed in these units.
pub type Timestamp = i64;

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("Data directory '{path}' is not accessible. {error}")]
    DataDirectory {
        #[source]
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to create cache directory '{path}'. {error}")]
    CacheDirectory {
        #[source]
        error: std::io::Error,
        path: PathBuf,
    },
}

/// Returns modification time of the file at `path`.
pub fn file_timestamp(path: &Path) -> std::io::Result<Timestamp> {
    let modified = path.metadata()?.modified()?;
    Ok(system_time_to_timestamp(modified))
}

pub fn system_time_to_timestamp(time: SystemTime) -> Timestamp {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as Timestamp,
        Err(err) => -(err.duration().as_millis() as Timestamp),
    }
}

/// Well-known locations on the file system.
#[derive(Clone, Debug)]
pub struct FileLocations {
    data: PathBuf,
    cache: PathBuf,
}

impl FileLocations {
    pub fn new(data: PathBuf, cache: PathBuf) -> Self {
        FileLocations { data, cache }
    }

    /// Returns canonical path to the directory with source data.
    ///
    /// Fails if the directory does not exist.
    pub fn data_directory(&self) -> Result<PathBuf, LocationError> {
        dunce::canonicalize(&self.data).map_err(|error| LocationError::DataDirectory {
            error,
            path: self.data.clone(),
        })
    }

    /// Returns path to the directory with cached objects.
    /// Creates the directory if needed.
    pub fn cache_directory(&self) -> Result<PathBuf, LocationError> {
        std::fs::create_dir_all(&self.cache).map_err(|error| LocationError::CacheDirectory {
            error,
            path: self.cache.clone(),
        })?;
        Ok(self.cache.clone())
    }

    /// Returns path to the source file backing object at `path`.
    pub fn source_file_path(&self, path: &AssetPath) -> Result<PathBuf, LocationError> {
        Ok(self.data_directory()?.join(path.to_file_path_string()))
    }
}
