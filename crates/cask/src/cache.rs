//! Disk storage of preprocessed objects.
//!
//! Every cached object gets an entry file named after SHA-256 of its path:
//! `<cache>/<hash>.toml`.
//! Resource payloads are stored per platform and per freshness timestamp:
//! `<cache>/<hash>.<platform>.<timestamp>.bin`.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use sha2::{Digest, Sha256};

use crate::{
    asset::{Asset, Resource},
    config::Config,
    files::{file_timestamp, FileLocations, LocationError, Timestamp},
    path::AssetPath,
    preprocess::{ObjectPreprocessor, PreprocessError, ResourceHandler},
};

const ENTRY_EXTENSION: &'static str = "toml";
const PAYLOAD_EXTENSION: &'static str = "bin";

/// Cached form of an object.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub path: AssetPath,
    pub timestamp: Timestamp,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub fields: toml::Table,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("Failed to read '{path}'. {error}")]
    ReadError {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to write '{path}'. {error}")]
    WriteError {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to remove '{path}'. {error}")]
    RemoveError {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to serialize cache entry '{path}'. {error}")]
    SerializeError {
        error: toml::ser::Error,
        path: PathBuf,
    },

    #[error("Failed to deserialize cache entry '{path}'. {error}")]
    DeserializeError {
        error: toml::de::Error,
        path: PathBuf,
    },

    #[error("No handler for resource type '{resource_type}'")]
    NoHandler { resource_type: String },

    #[error("Failed to preprocess '{path}' for platform '{platform}'. {error}")]
    PreprocessError {
        #[source]
        error: PreprocessError,
        path: AssetPath,
        platform: String,
    },
}

/// Object preprocessor storing cache in a directory.
pub struct DiskObjectPreprocessor {
    locations: FileLocations,

    /// First one is primary.
    platforms: Vec<String>,
    handlers: HashMap<String, Box<dyn ResourceHandler>>,
}

impl DiskObjectPreprocessor {
    pub fn new(config: &Config) -> Self {
        DiskObjectPreprocessor {
            locations: config.locations(),
            platforms: config.platforms().to_vec(),
            handlers: HashMap::new(),
        }
    }

    /// Registers handler for its resource type.
    /// Replaces previously registered handler for the same type.
    pub fn register_handler(&mut self, handler: Box<dyn ResourceHandler>) {
        let resource_type = handler.resource_type().to_owned();
        if self.handlers.insert(resource_type.clone(), handler).is_some() {
            tracing::warn!("Handler for '{}' replaced", resource_type);
        }
    }

    /// Reads cache entry of the object.
    /// Returns `Ok(None)` if object is not cached.
    pub fn cached_entry(&self, path: &AssetPath) -> Result<Option<CacheEntry>, CacheError> {
        let entry_path = self.entry_path(path)?;

        let data = match std::fs::read_to_string(&entry_path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(CacheError::ReadError {
                    error,
                    path: entry_path,
                })
            }
            Ok(data) => data,
        };

        let entry = toml::from_str(&data).map_err(|error| CacheError::DeserializeError {
            error,
            path: entry_path,
        })?;
        Ok(Some(entry))
    }

    /// Returns true if the object is cached with exactly this timestamp.
    pub fn is_fresh(&self, path: &AssetPath, timestamp: Timestamp) -> bool {
        match self.cached_entry(path) {
            Ok(Some(entry)) => entry.timestamp == timestamp,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("{}", err);
                false
            }
        }
    }

    /// Returns path to the payload of the object for the platform.
    pub fn payload_path(
        &self,
        path: &AssetPath,
        platform: &str,
        timestamp: Timestamp,
    ) -> Result<PathBuf, CacheError> {
        let cache = self.locations.cache_directory()?;
        Ok(cache.join(format!(
            "{}.{}.{}.{}",
            path_hash(path),
            platform,
            timestamp,
            PAYLOAD_EXTENSION
        )))
    }

    fn entry_path(&self, path: &AssetPath) -> Result<PathBuf, CacheError> {
        let cache = self.locations.cache_directory()?;
        Ok(cache.join(format!("{}.{}", path_hash(path), ENTRY_EXTENSION)))
    }

    fn write_entry(&self, object: &Asset, timestamp: Timestamp) -> Result<(), CacheError> {
        let entry = CacheEntry {
            path: object.path().clone(),
            timestamp,
            type_name: object.type_name().to_owned(),
            resource_type: object
                .as_resource()
                .map(|resource| resource.resource_type().to_owned()),
            fields: object.fields().clone(),
        };

        let entry_path = self.entry_path(object.path())?;
        let data = toml::to_string_pretty(&entry).map_err(|error| CacheError::SerializeError {
            error,
            path: entry_path.clone(),
        })?;

        write_file(&entry_path, data.as_bytes())
    }

    /// Removes payloads of the object with timestamps other than `keep`.
    fn evict_payloads(&self, path: &AssetPath, keep: Timestamp) -> Result<usize, CacheError> {
        let cache = self.locations.cache_directory()?;
        let prefix = format!("{}.", path_hash(path));
        let suffix = format!(".{}", PAYLOAD_EXTENSION);

        let dir = std::fs::read_dir(&cache).map_err(|error| CacheError::ReadError {
            error,
            path: cache.clone(),
        })?;

        let mut evicted = 0;
        for entry in dir {
            let entry = entry.map_err(|error| CacheError::ReadError {
                error,
                path: cache.clone(),
            })?;

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name
                .strip_prefix(&*prefix)
                .and_then(|rest| rest.strip_suffix(&*suffix))
            else {
                continue;
            };

            // `rest` is `<platform>.<timestamp>`.
            let timestamp = rest
                .rsplit_once('.')
                .and_then(|(_, timestamp)| timestamp.parse::<Timestamp>().ok());

            if timestamp != Some(keep) {
                let path = entry.path();
                std::fs::remove_file(&path)
                    .map_err(|error| CacheError::RemoveError { error, path })?;
                evicted += 1;
            }
        }

        Ok(evicted)
    }

    fn try_cache_object(
        &self,
        object: &Asset,
        timestamp: Timestamp,
        evict: bool,
    ) -> Result<(), CacheError> {
        self.write_entry(object, timestamp)?;

        if evict && object.as_resource().is_some() {
            let evicted = self.evict_payloads(object.path(), timestamp)?;
            if evicted > 0 {
                tracing::debug!("Evicted {} stale payloads of '{}'", evicted, object.path());
            }
        }

        Ok(())
    }

    fn try_load_resource_data(
        &self,
        path: &AssetPath,
        resource: &Resource,
        timestamp: Timestamp,
    ) -> Result<Box<[u8]>, CacheError> {
        let primary = &self.platforms[0];

        // Payload is keyed by the same freshness timestamp the cache entry gets,
        // so that eviction keeps it.
        let source_path = self.locations.source_file_path(&path.base_resource_path())?;
        let source_timestamp =
            file_timestamp(&source_path).map_err(|error| CacheError::ReadError {
                error,
                path: source_path.clone(),
            })?;
        let timestamp = timestamp.max(source_timestamp);

        let payload_path = self.payload_path(path, primary, timestamp)?;
        match std::fs::read(&payload_path) {
            Ok(data) => return Ok(data.into_boxed_slice()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(CacheError::ReadError {
                    error,
                    path: payload_path,
                })
            }
        }

        let handler = self
            .handlers
            .get(resource.resource_type())
            .ok_or_else(|| CacheError::NoHandler {
                resource_type: resource.resource_type().to_owned(),
            })?;

        let source =std::fs::read(&source_path).map_err(|error| CacheError::ReadError {
            error,
            path: source_path,
        })?;

        let mut primary_payload = None;
        for platform in &self.platforms {
            let payload =
                handler
                    .preprocess(&source, platform)
                    .map_err(|error| CacheError::PreprocessError {
                        error,
                        path: path.clone(),
                        platform: platform.clone(),
                    })?;

            write_file(&self.payload_path(path, platform, timestamp)?, &payload)?;

            if primary_payload.is_none() {
                primary_payload = Some(payload);
            }
        }

        tracing::debug!("Preprocessed '{}' for {:?}", path, self.platforms);

        // Config never yields empty platform list.
        Ok(primary_payload.unwrap_or_default())
    }
}

impl ObjectPreprocessor for DiskObjectPreprocessor {
    fn cache_object(
        &self,
        object: &Asset,
        timestamp: Timestamp,
        evict_platform_preprocessed_resource_data: bool,
    ) -> bool {
        match self.try_cache_object(object, timestamp, evict_platform_preprocessed_resource_data)
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("{}", err);
                false
            }
        }
    }

    fn load_resource_data(
        &self,
        path: &AssetPath,
        resource: &mut Resource,
        timestamp: Timestamp,
    ) -> bool {
        match self.try_load_resource_data(path, resource, timestamp) {
            Ok(payload) => {
                resource.set_preprocessed(payload);
                true
            }
            Err(err) => {
                tracing::warn!("Failed to load resource data of '{}'. {}", path, err);
                false
            }
        }
    }
}

fn path_hash(path: &AssetPath) -> String {
    format!("{:x}", Sha256::digest(path.as_str().as_bytes()))
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    std::fs::write(path, data).map_err(|error| CacheError::WriteError {
        error,
        path: path.to_owned(),
    })
}
