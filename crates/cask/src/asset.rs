use std::fmt;

use hashbrown::HashMap;

use crate::{loader::SharedPackageLoader, path::AssetPath};

bitflags::bitflags! {
    /// State flags of a loaded object.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AssetFlags: u32 {
        /// Object failed to load or is in inconsistent state.
        const BROKEN = 1 << 0;

        /// Canonical default instance of a type.
        /// Supplies default field values and is never persisted.
        const DEFAULT_TEMPLATE = 1 << 1;
    }
}

/// Stable index of an object in [`AssetTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetIndex(u32);

impl AssetIndex {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AssetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Object whose payload references external source data.
#[derive(Clone, Debug, Default)]
pub struct Resource {
    resource_type: String,

    /// Payload preprocessed for the primary platform.
    preprocessed: Option<Box<[u8]>>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Resource {
            resource_type: resource_type.into(),
            preprocessed: None,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn preprocessed(&self) -> Option<&[u8]> {
        self.preprocessed.as_deref()
    }

    pub fn set_preprocessed(&mut self, data: Box<[u8]>) {
        self.preprocessed = Some(data);
    }
}

/// Container node of the namespace.
#[derive(Clone, Default)]
pub struct Package {
    loader: Option<SharedPackageLoader>,
}

impl Package {
    pub fn new(loader: Option<SharedPackageLoader>) -> Self {
        Package { loader }
    }

    pub fn loader(&self) -> Option<&SharedPackageLoader> {
        self.loader.as_ref()
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum AssetKind {
    Object,
    Resource(Resource),
    Package(Package),
}

/// In-memory object addressed by [`AssetPath`].
#[derive(Clone, Debug)]
pub struct Asset {
    path: AssetPath,
    owner: Option<AssetIndex>,
    flags: AssetFlags,
    type_name: String,
    fields: toml::Table,
    kind: AssetKind,
}

impl Asset {
    pub fn new(path: AssetPath, type_name: impl Into<String>, kind: AssetKind) -> Self {
        Asset {
            path,
            owner: None,
            flags: AssetFlags::empty(),
            type_name: type_name.into(),
            fields: toml::Table::new(),
            kind,
        }
    }

    pub fn with_flags(mut self, flags: AssetFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fields(mut self, fields: toml::Table) -> Self {
        self.fields = fields;
        self
    }

    pub fn path(&self) -> &AssetPath {
        &self.path
    }

    /// Returns object owning this one.
    /// Owner is assigned on insertion into [`AssetTable`].
    pub fn owner(&self) -> Option<AssetIndex> {
        self.owner
    }

    pub fn flags(&self) -> AssetFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: AssetFlags) {
        self.flags |= flags;
    }

    pub fn is_broken(&self) -> bool {
        self.flags.contains(AssetFlags::BROKEN)
    }

    pub fn is_default_template(&self) -> bool {
        self.flags.contains(AssetFlags::DEFAULT_TEMPLATE)
    }

    pub fn is_package(&self) -> bool {
        matches!(self.kind, AssetKind::Package(_))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &toml::Table {
        &self.fields
    }

    pub fn kind(&self) -> &AssetKind {
        &self.kind
    }

    pub fn as_resource(&self) -> Option<&Resource> {
        match &self.kind {
            AssetKind::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn as_resource_mut(&mut self) -> Option<&mut Resource> {
        match &mut self.kind {
            AssetKind::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn as_package(&self) -> Option<&Package> {
        match &self.kind {
            AssetKind::Package(package) => Some(package),
            _ => None,
        }
    }
}

/// Raw object produced by a package loader.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetRecord {
    pub path: AssetPath,
    pub type_name: String,
    pub flags: AssetFlags,

    /// Resource type if the object is a resource.
    pub resource_type: Option<String>,

    pub fields: toml::Table,
}

impl AssetRecord {
    pub fn into_asset(self) -> Asset {
        let kind = match self.resource_type {
            None => AssetKind::Object,
            Some(resource_type) => AssetKind::Resource(Resource::new(resource_type)),
        };

        Asset::new(self.path, self.type_name, kind)
            .with_flags(self.flags)
            .with_fields(self.fields)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Object '{path}' is already present")]
pub struct DuplicatePath {
    pub path: AssetPath,
}

/// Arena of loaded objects.
///
/// Objects are never moved or removed, so [`AssetIndex`] stays valid
/// for the lifetime of the table.
/// Each object keeps non-owning index of its owner.
#[derive(Default)]
pub struct AssetTable {
    assets: Vec<Asset>,
    by_path: HashMap<AssetPath, AssetIndex>,
}

impl AssetTable {
    pub fn new() -> Self {
        AssetTable::default()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Inserts new object.
    ///
    /// Owner of the object is the nearest ancestor already present in the table.
    pub fn insert(&mut self, asset: Asset) -> Result<AssetIndex, DuplicatePath> {
        if self.by_path.contains_key(asset.path()) {
            return Err(DuplicatePath {
                path: asset.path.clone(),
            });
        }

        Ok(self.push(asset))
    }

    /// Returns object at `path`, inserting one made by `make` if absent.
    pub fn get_or_insert_with(
        &mut self,
        path: &AssetPath,
        make: impl FnOnce() -> Asset,
    ) -> AssetIndex {
        if let Some(index) = self.find(path) {
            return index;
        }

        let asset = make();
        debug_assert_eq!(asset.path(), path);
        self.push(asset)
    }

    fn push(&mut self, mut asset: Asset) -> AssetIndex {
        asset.owner = asset
            .path
            .parent()
            .ancestors()
            .find_map(|ancestor| self.by_path.get(&ancestor).copied());

        let index = AssetIndex(self.assets.len() as u32);
        self.by_path.insert(asset.path.clone(), index);
        self.assets.push(asset);
        index
    }

    pub fn get(&self, index: AssetIndex) -> Option<&Asset> {
        self.assets.get(index.index())
    }

    pub fn get_mut(&mut self, index: AssetIndex) -> Option<&mut Asset> {
        self.assets.get_mut(index.index())
    }

    pub fn find(&self, path: &AssetPath) -> Option<AssetIndex> {
        self.by_path.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetIndex, &Asset)> + '_ {
        self.assets
            .iter()
            .enumerate()
            .map(|(idx, asset)| (AssetIndex(idx as u32), asset))
    }

    /// Walks owner chain starting from `index` until a package is reached.
    pub fn owning_package(&self, index: AssetIndex) -> Option<AssetIndex> {
        let mut current = Some(index);
        while let Some(index) = current {
            let asset = self.get(index)?;
            if asset.is_package() {
                return Some(index);
            }
            current = asset.owner;
        }
        None
    }
}
