//! Loader for source archive packages.
//!
//! Package `/Game/Textures` is stored in `<data>/Game/Textures.toml`.
//! Source data of resources lives next to it, in `<data>/Game/Textures/`.
//!
//! ```toml
//! [[object]]
//! name = "Stone.png"
//! type = "Texture"
//! resource = "texture"
//!
//! [object.fields]
//! srgb = true
//!
//! [[object]]
//! name = "Stone.png:Mip0"
//! type = "Texture"
//! resource = "texture"
//! ```

use std::{path::PathBuf, sync::Arc};

use hashbrown::HashMap;
use slab::Slab;

use crate::{
    asset::{AssetFlags, AssetRecord},
    files::{file_timestamp, FileLocations, Timestamp},
    loader::{
        share_loader, LoadError, LoadStatus, PackageLoader, PackageLoaderFactory,
        SharedPackageLoader,
    },
    path::AssetPath,
};

pub const ARCHIVE_EXTENSION: &'static str = "toml";

#[derive(serde::Deserialize)]
struct ArchiveFile {
    #[serde(default, rename = "object")]
    objects: Vec<ArchiveObject>,
}

#[derive(serde::Deserialize)]
struct ArchiveObject {
    /// Object path relative to the package, `:`-separated.
    name: String,

    #[serde(rename = "type")]
    type_name: String,

    /// Resource type if the object is a resource.
    #[serde(default)]
    resource: Option<String>,

    #[serde(default)]
    default_template: bool,

    #[serde(default)]
    fields: toml::Table,
}

enum State {
    Idle,
    Reading(flume::Receiver<std::io::Result<String>>),
    Ready(HashMap<AssetPath, AssetRecord>),
    Failed(LoadError),
}

/// Loads objects from a source archive file.
///
/// The file is read on a background thread when the first object is requested.
pub struct ArchivePackageLoader {
    package: AssetPath,
    file: PathBuf,
    timestamp: Timestamp,
    state: State,
    requests: Slab<AssetPath>,
}

impl ArchivePackageLoader {
    pub fn new(package: AssetPath, file: PathBuf, timestamp: Timestamp) -> Self {
        ArchivePackageLoader {
            package,
            file,
            timestamp,
            state: State::Idle,
            requests: Slab::new(),
        }
    }

    fn start_reading(&mut self) {
        let (tx, rx) = flume::bounded(1);
        let file = self.file.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("cask-read {}", self.package))
            .spawn(move || {
                // Receiver may be gone if the loader was dropped.
                let _ = tx.send(std::fs::read_to_string(&file));
            });

        self.state = match spawned {
            Ok(_) => State::Reading(rx),
            Err(error) => State::Failed(LoadError::Read {
                error: Arc::new(error),
                path: self.file.clone(),
            }),
        };
    }

    fn parse(&self, text: &str) -> Result<HashMap<AssetPath, AssetRecord>, LoadError> {
        let archive: ArchiveFile = toml::from_str(text).map_err(|error| LoadError::Parse {
            error: Arc::new(error),
            path: self.file.clone(),
        })?;

        let mut records = HashMap::with_capacity(archive.objects.len());

        for object in archive.objects {
            let path = self
                .package
                .join_objects(&object.name)
                .map_err(|error| LoadError::InvalidName {
                    error,
                    name: object.name.clone(),
                    path: self.file.clone(),
                })?;

            let mut flags = AssetFlags::empty();
            if object.default_template {
                flags |= AssetFlags::DEFAULT_TEMPLATE;
            }

            let record = AssetRecord {
                path: path.clone(),
                type_name: object.type_name,
                flags,
                resource_type: object.resource,
                fields: object.fields,
            };

            if records.insert(path, record).is_some() {
                return Err(LoadError::DuplicateObject {
                    name: object.name,
                    path: self.file.clone(),
                });
            }
        }

        // Objects nested in undeclared objects have no consistent owner.
        let orphans: Vec<AssetPath> = records
            .keys()
            .filter(|path| {
                path.parent()
                    .ancestors()
                    .take_while(|ancestor| !ancestor.is_package())
                    .any(|ancestor| !records.contains_key(&ancestor))
            })
            .cloned()
            .collect();

        for path in orphans {
            tracing::warn!("Object '{}' has no declared owner", path);
            if let Some(record) = records.get_mut(&path) {
                record.flags |= AssetFlags::BROKEN;
            }
        }

        Ok(records)
    }
}

impl PackageLoader for ArchivePackageLoader {
    fn package_path(&self) -> &AssetPath {
        &self.package
    }

    fn begin_load_object(&mut self, path: &AssetPath) -> Option<usize> {
        if path.package_path() != self.package || path.is_package() {
            return None;
        }

        if let State::Idle = self.state {
            self.start_reading();
        }

        Some(self.requests.insert(path.clone()))
    }

    fn try_finish_load_object(&mut self, request: usize) -> LoadStatus {
        match &self.state {
            State::Idle | State::Reading(_) => LoadStatus::Pending,
            State::Ready(records) => match self.requests.try_remove(request) {
                None => LoadStatus::NotFound,
                Some(path) => match records.get(&path) {
                    None => LoadStatus::NotFound,
                    Some(record) => LoadStatus::Loaded(record.clone()),
                },
            },
            State::Failed(error) => {
                let error = error.clone();
                self.requests.try_remove(request);
                LoadStatus::Failed(error)
            }
        }
    }

    fn tick(&mut self) {
        let State::Reading(rx) = &self.state else {
            return;
        };

        let result = match rx.try_recv() {
            Err(flume::TryRecvError::Empty) => return,
            Err(flume::TryRecvError::Disconnected) => Err(LoadError::Interrupted {
                path: self.file.clone(),
            }),
            Ok(Err(error)) => Err(LoadError::Read {
                error: Arc::new(error),
                path: self.file.clone(),
            }),
            Ok(Ok(text)) => self.parse(&text),
        };

        self.state = match result {
            Ok(records) => {
                tracing::debug!(
                    "Package '{}' is ready with {} objects",
                    self.package,
                    records.len()
                );
                State::Ready(records)
            }
            Err(error) => {
                tracing::error!("Failed to load package '{}'. {}", self.package, error);
                State::Failed(error)
            }
        };
    }

    fn is_source_package_file(&self) -> bool {
        true
    }

    fn file_timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Opens [`ArchivePackageLoader`] for packages that have archive file in the data directory.
pub struct ArchivePackageLoaderFactory {
    locations: FileLocations,
}

impl ArchivePackageLoaderFactory {
    pub fn new(locations: FileLocations) -> Self {
        ArchivePackageLoaderFactory { locations }
    }
}

impl PackageLoaderFactory for ArchivePackageLoaderFactory {
    fn open(&self, package_path: &AssetPath) -> Option<SharedPackageLoader> {
        let data = match self.locations.data_directory() {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("Cannot open package '{}'. {}", package_path, err);
                return None;
            }
        };

        let file = data.join(format!(
            "{}.{}",
            package_path.to_file_path_string(),
            ARCHIVE_EXTENSION
        ));

        let timestamp = match file_timestamp(&file) {
            Ok(timestamp) => timestamp,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(
                    "Failed to check package file '{}'. {}",
                    file.display(),
                    err
                );
                return None;
            }
        };

        Some(share_loader(ArchivePackageLoader::new(
            package_path.clone(),
            file,
            timestamp,
        )))
    }
}
