//! Loading and caching of objects stored in hierarchical packages.
//!
//! Objects are addressed by [`AssetPath`]s like `/Game/Textures:Stone.png:Mip0`.
//! Packages are opened on demand by [`PackageLoader`]s,
//! loaded objects are kept in [`AssetTable`] and handed to an [`ObjectPreprocessor`]
//! that maintains the persistent cache.
//! [`ObjectLoader`] ties all of it together.

mod archive;
mod asset;
mod cache;
mod config;
mod files;
mod instance;
mod loader;
mod object_loader;
mod path;
mod preprocess;
mod registry;

pub use self::{
    archive::{ArchivePackageLoader, ArchivePackageLoaderFactory, ARCHIVE_EXTENSION},
    asset::{
        Asset, AssetFlags, AssetIndex, AssetKind, AssetRecord, AssetTable, DuplicatePath,
        Package, Resource,
    },
    cache::{CacheEntry, CacheError, DiskObjectPreprocessor},
    config::{Config, ConfigBoundary, ConfigError, ConfigInfo, CONFIG_FILE_NAME},
    files::{file_timestamp, system_time_to_timestamp, FileLocations, LocationError, Timestamp},
    instance::InstanceSlot,
    loader::{
        share_loader, LoadError, LoadStatus, PackageLoader, PackageLoaderFactory,
        SharedPackageLoader,
    },
    object_loader::{LoadRequestId, ObjectLoader, PACKAGE_TYPE},
    path::{AssetPath, ParsePathError},
    preprocess::{ObjectPreprocessor, PassthroughHandler, PreprocessError, ResourceHandler},
    registry::PackageLoaderMap,
};
