//! Object loader drives package loaders and decides what gets cached.
//!
//! Loading is poll-driven.
//! Callers start requests with [`ObjectLoader::begin_load_object`]
//! and call [`ObjectLoader::tick`] until [`ObjectLoader::try_finish_load`] is ready.
//! Completion callbacks run synchronously inside `tick`,
//! resource precache always comes before caching of the same object.

use std::{sync::Arc, task::Poll};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use slab::Slab;

use crate::{
    archive::ArchivePackageLoaderFactory,
    asset::{Asset, AssetIndex, AssetKind, AssetRecord, AssetTable, Package},
    config::{Config, ConfigBoundary},
    files::{file_timestamp, FileLocations},
    instance::InstanceSlot,
    loader::{LoadStatus, PackageLoaderFactory, SharedPackageLoader},
    path::AssetPath,
    preprocess::ObjectPreprocessor,
    registry::PackageLoaderMap,
};

/// Type name given to package objects.
pub const PACKAGE_TYPE: &'static str = "Package";

/// Id of a load request.
///
/// Every holder of the id must claim the result exactly once
/// with [`ObjectLoader::try_finish_load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoadRequestId(usize);

enum RequestState {
    Dispatched {
        loader: SharedPackageLoader,
        request: usize,
    },

    /// Claimed by a `tick` that is polling the package loader.
    Finishing,
    Complete(Option<AssetIndex>),
    Failed,
}

struct LoadRequest {
    path: AssetPath,
    state: RequestState,

    /// Number of callers that haven't claimed the result yet.
    holders: usize,
}

#[derive(Default)]
struct Requests {
    slab: Slab<LoadRequest>,

    /// Requests still waiting for their package loader.
    in_flight: HashMap<AssetPath, usize>,
}

/// Loads objects from package loaders and caches them.
pub struct ObjectLoader {
    package_loaders: PackageLoaderMap,
    preprocessor: Arc<InstanceSlot<dyn ObjectPreprocessor>>,
    boundary: ConfigBoundary,
    locations: FileLocations,
    assets: RwLock<AssetTable>,
    requests: Mutex<Requests>,
}

impl ObjectLoader {
    pub fn new(
        config: &Config,
        factory: Box<dyn PackageLoaderFactory>,
        preprocessor: Arc<InstanceSlot<dyn ObjectPreprocessor>>,
    ) -> Self {
        ObjectLoader {
            package_loaders: PackageLoaderMap::new(factory),
            preprocessor,
            boundary: config.boundary().clone(),
            locations: config.locations(),
            assets: RwLock::new(AssetTable::new()),
            requests: Mutex::new(Requests::default()),
        }
    }

    /// Creates loader reading source archive packages from the data directory.
    pub fn archive(
        config: &Config,
        preprocessor: Arc<InstanceSlot<dyn ObjectPreprocessor>>,
    ) -> Self {
        let factory = ArchivePackageLoaderFactory::new(config.locations());
        ObjectLoader::new(config, Box::new(factory), preprocessor)
    }

    /// Puts new archive object loader into the slot.
    ///
    /// Returns false if the slot already holds a loader.
    /// Existing loader is left intact.
    pub fn initialize_static_instance(
        slot: &InstanceSlot<ObjectLoader>,
        config: &Config,
        preprocessor: Arc<InstanceSlot<dyn ObjectPreprocessor>>,
    ) -> bool {
        slot.initialize_with(|| Arc::new(ObjectLoader::archive(config, preprocessor)))
    }

    pub fn assets(&self) -> RwLockReadGuard<'_, AssetTable> {
        self.assets.read()
    }

    pub fn assets_mut(&self) -> RwLockWriteGuard<'_, AssetTable> {
        self.assets.write()
    }

    pub fn preprocessor(&self) -> &InstanceSlot<dyn ObjectPreprocessor> {
        &self.preprocessor
    }

    pub fn config_boundary(&self) -> &ConfigBoundary {
        &self.boundary
    }

    /// Returns loader of the container owning `path`.
    pub fn get_package_loader(&self, path: &AssetPath) -> Option<SharedPackageLoader> {
        self.package_loaders.get_package_loader(path)
    }

    pub fn tick_package_loaders(&self) {
        self.package_loaders.tick_package_loaders();
    }

    /// Starts loading object at `path`.
    ///
    /// Loads of the same path that are still in flight are shared.
    #[tracing::instrument(skip(self))]
    pub fn begin_load_object(&self, path: &AssetPath) -> LoadRequestId {
        let mut requests = self.requests.lock();

        if let Some(&id) = requests.in_flight.get(path) {
            requests.slab[id].holders += 1;
            tracing::debug!("Joined in-flight load");
            return LoadRequestId(id);
        }

        let state = self.dispatch(path);
        let dispatched = matches!(state, RequestState::Dispatched { .. });

        let id = requests.slab.insert(LoadRequest {
            path: path.clone(),
            state,
            holders: 1,
        });

        if dispatched {
            requests.in_flight.insert(path.clone(), id);
        }

        LoadRequestId(id)
    }

    /// Claims result of the request.
    ///
    /// Returns `Poll::Ready(None)` if object was not found or failed to load.
    pub fn try_finish_load(&self, id: LoadRequestId) -> Poll<Option<AssetIndex>> {
        let mut requests = self.requests.lock();

        let Some(request) = requests.slab.get_mut(id.0) else {
            tracing::warn!("Unknown load request {:?}", id);
            return Poll::Ready(None);
        };

        let result = match &request.state {
            RequestState::Dispatched { .. } | RequestState::Finishing => return Poll::Pending,
            RequestState::Complete(index) => *index,
            RequestState::Failed => None,
        };

        request.holders -= 1;
        if request.holders == 0 {
            requests.slab.remove(id.0);
        }

        Poll::Ready(result)
    }

    /// Loads object, ticking package loaders until it's done.
    pub fn load_object(&self, path: &AssetPath) -> Option<AssetIndex> {
        let id = self.begin_load_object(path);
        loop {
            if let Poll::Ready(result) = self.try_finish_load(id) {
                return result;
            }
            self.tick();
            std::thread::yield_now();
        }
    }

    /// Advances package loaders and completes finished requests.
    pub fn tick(&self) {
        self.tick_package_loaders();

        // Claimed requests are skipped by concurrent ticks.
        let claimed: Vec<(usize, AssetPath, SharedPackageLoader, usize)> = {
            let mut requests = self.requests.lock();
            requests
                .slab
                .iter_mut()
                .filter_map(|(id, entry)| {
                    match std::mem::replace(&mut entry.state, RequestState::Finishing) {
                        RequestState::Dispatched { loader, request } => {
                            Some((id, entry.path.clone(), loader, request))
                        }
                        state => {
                            entry.state = state;
                            None
                        }
                    }
                })
                .collect()
        };

        for (id, path, loader, request) in claimed {
            let status = loader.lock().try_finish_load_object(request);

            let state = match status {
                LoadStatus::Pending => {
                    if let Some(entry) = self.requests.lock().slab.get_mut(id) {
                        entry.state = RequestState::Dispatched { loader, request };
                    }
                    continue;
                }
                LoadStatus::Loaded(record) => {
                    RequestState::Complete(self.finish_load(&path, record, &loader))
                }
                LoadStatus::NotFound => {
                    tracing::debug!("Object '{}' not found", path);
                    self.on_load_complete(&path, None);
                    RequestState::Complete(None)
                }
                LoadStatus::Failed(err) => {
                    tracing::error!("Failed to load object '{}'. {}", path, err);
                    RequestState::Failed
                }
            };

            let mut requests = self.requests.lock();
            if let Some(entry) = requests.slab.get_mut(id) {
                entry.state = state;
            }
            requests.in_flight.remove(&path);
        }
    }

    /// Called once for every completed load.
    /// Loaded objects are cached with stale platform data evicted.
    pub fn on_load_complete(&self, path: &AssetPath, object: Option<AssetIndex>) {
        if let Some(object) = object {
            tracing::trace!("Object '{}' loaded as {}", path, object);
            self.cache_object(object, true);
        }
    }

    /// Called when object fields are loaded, before its resource data is used.
    ///
    /// Prepares resource payload using container timestamp.
    /// Returns true if payload was prepared.
    pub fn on_precache_ready(&self, object: AssetIndex, loader: &SharedPackageLoader) -> bool {
        let (path, mut resource, preprocessor) = {
            let assets = self.assets.read();
            let Some(asset) = assets.get(object) else {
                tracing::warn!("Precache of unknown object {}", object);
                return false;
            };

            // Default templates never have resource data preprocessed.
            if asset.is_default_template() {
                return false;
            }

            let Some(preprocessor) = self.preprocessor.get() else {
                tracing::warn!("Missing object preprocessor to use for resource preprocessing");
                return false;
            };

            let Some(resource) = asset.as_resource() else {
                return false;
            };
            (asset.path().clone(), resource.clone(), preprocessor)
        };

        let (is_source, timestamp) = {
            let loader = loader.lock();
            (loader.is_source_package_file(), loader.file_timestamp())
        };

        debug_assert!(is_source, "Resource '{}' is not from a source package", path);
        if !is_source {
            tracing::error!("Resource '{}' is not from a source package", path);
            return false;
        }

        // Preprocessing runs on a copy so that the table is not locked meanwhile.
        if !preprocessor.load_resource_data(&path, &mut resource, timestamp) {
            return false;
        }

        match self
            .assets
            .write()
            .get_mut(object)
            .and_then(Asset::as_resource_mut)
        {
            Some(slot) => {
                *slot = resource;
                true
            }
            None => false,
        }
    }

    /// Caches object if it is eligible.
    ///
    /// Freshness timestamp is the newest of the package file timestamp
    /// and, for resources, the source data file timestamp.
    pub fn cache_object(
        &self,
        object: AssetIndex,
        evict_platform_preprocessed_resource_data: bool,
    ) -> bool {
        let assets = self.assets.read();
        let Some(asset) = assets.get(object) else {
            tracing::warn!("Caching of unknown object {}", object);
            return false;
        };

        if asset.is_broken() || asset.is_package() {
            return false;
        }

        let Some(preprocessor) = self.preprocessor.get() else {
            tracing::warn!("Missing object preprocessor to use for caching");
            return false;
        };

        let path = asset.path().clone();

        // Configuration objects are never cached.
        if self.boundary.contains(&path) {
            return false;
        }

        if asset.is_default_template() {
            return false;
        }

        let loader = assets
            .owning_package(object)
            .and_then(|package| assets.get(package))
            .and_then(Asset::as_package)
            .and_then(Package::loader);

        debug_assert!(loader.is_some(), "Object '{}' has no package loader", path);
        let Some(loader) = loader else {
            tracing::error!("Object '{}' has no package loader", path);
            return false;
        };

        let (is_source, mut timestamp) = {
            let loader = loader.lock();
            (loader.is_source_package_file(), loader.file_timestamp())
        };

        debug_assert!(is_source, "Object '{}' is not from a source package", path);
        if !is_source {
            tracing::error!("Object '{}' is not from a source package", path);
            return false;
        }

        if asset.as_resource().is_some() {
            // Sub-resources share the source file of the top-level resource.
            let base = path.base_resource_path();

            let data = match self.locations.data_directory() {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!("Could not obtain data directory. {}", err);
                    return false;
                }
            };

            let source = data.join(base.to_file_path_string());
            match file_timestamp(&source) {
                Ok(source_timestamp) => timestamp = timestamp.max(source_timestamp),
                Err(err) => {
                    tracing::warn!(
                        "Failed to check source file '{}' of '{}'. {}",
                        source.display(),
                        path,
                        err
                    );
                    return false;
                }
            }
        }

        // Table stays unlocked while the preprocessor writes the cache.
        let asset = asset.clone();
        drop(assets);

        let success = preprocessor.cache_object(
            &asset,
            timestamp,
            evict_platform_preprocessed_resource_data,
        );
        if !success {
            tracing::error!("Failed to cache object \"{}\"", path);
        }
        success
    }

    fn dispatch(&self, path: &AssetPath) -> RequestState {
        if let Some(index) = self.assets.read().find(path) {
            return RequestState::Complete(Some(index));
        }

        let Some(loader) = self.get_package_loader(path) else {
            tracing::warn!("No package contains '{}'", path);
            return RequestState::Failed;
        };

        self.ensure_package(&loader);

        // Path may name the package itself.
        if let Some(index) = self.assets.read().find(path) {
            return RequestState::Complete(Some(index));
        }

        let request = loader.lock().begin_load_object(path);
        match request {
            Some(request) => RequestState::Dispatched { loader, request },
            None => RequestState::Complete(None),
        }
    }

    fn ensure_package(&self, loader: &SharedPackageLoader) -> AssetIndex {
        let package_path = loader.lock().package_path().clone();

        self.assets.write().get_or_insert_with(&package_path, || {
            Asset::new(
                package_path.clone(),
                PACKAGE_TYPE,
                AssetKind::Package(Package::new(Some(loader.clone()))),
            )
        })
    }

    fn finish_load(
        &self,
        path: &AssetPath,
        record: AssetRecord,
        loader: &SharedPackageLoader,
    ) -> Option<AssetIndex> {
        let inserted = self.assets.write().insert(record.into_asset());

        let index = match inserted {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!("{}", err);
                return self.assets.read().find(&err.path);
            }
        };

        self.on_precache_ready(index, loader);
        self.on_load_complete(path, Some(index));
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Weak,
        },
        time::{Duration, Instant, UNIX_EPOCH},
    };

    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;
    use crate::{
        asset::{AssetFlags, Resource},
        cache::DiskObjectPreprocessor,
        config::ConfigInfo,
        files::Timestamp,
        loader::{share_loader, LoadError, PackageLoader},
        preprocess::{PreprocessError, ResourceHandler},
    };

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Precache(AssetPath, Timestamp),
        Cache(AssetPath, Timestamp, bool),
    }

    #[derive(Default)]
    struct RecordingPreprocessor {
        events: Mutex<Vec<Event>>,
        fail: AtomicBool,

        /// Time spent in every call.
        delay: Mutex<Duration>,

        /// Loader whose table is checked for being unlocked during calls.
        observed: Mutex<Option<Weak<ObjectLoader>>>,
        table_unlocked: Mutex<Vec<bool>>,
    }

    impl RecordingPreprocessor {
        fn work(&self) {
            let observed = self.observed.lock().as_ref().and_then(Weak::upgrade);
            if let Some(loader) = observed {
                let unlocked = loader.assets.try_write().is_some();
                self.table_unlocked.lock().push(unlocked);
            }
            std::thread::sleep(*self.delay.lock());
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn cached(&self) -> Vec<(AssetPath, Timestamp, bool)> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Cache(path, timestamp, evict) => Some((path, timestamp, evict)),
                    _ => None,
                })
                .collect()
        }
    }

    impl ObjectPreprocessor for RecordingPreprocessor {
        fn cache_object(&self, object: &Asset, timestamp: Timestamp, evict: bool) -> bool {
            self.work();
            self.events
                .lock()
                .push(Event::Cache(object.path().clone(), timestamp, evict));
            !self.fail.load(Ordering::Relaxed)
        }

        fn load_resource_data(
            &self,
            path: &AssetPath,
            resource: &mut Resource,
            timestamp: Timestamp,
        ) -> bool {
            self.work();
            self.events
                .lock()
                .push(Event::Precache(path.clone(), timestamp));
            resource.set_preprocessed(Box::new([]));
            true
        }
    }

    /// In-memory package that completes requests after a number of ticks.
    struct MemoryLoader {
        package: AssetPath,
        records: HashMap<AssetPath, AssetRecord>,
        source: bool,
        timestamp: Timestamp,
        delay: usize,
        fail: bool,
        requests: Slab<(AssetPath, usize)>,
        begun: Arc<AtomicUsize>,
    }

    impl PackageLoader for MemoryLoader {
        fn package_path(&self) -> &AssetPath {
            &self.package
        }

        fn begin_load_object(&mut self, path: &AssetPath) -> Option<usize> {
            if path.package_path() != self.package {
                return None;
            }
            self.begun.fetch_add(1, Ordering::Relaxed);
            Some(self.requests.insert((path.clone(), self.delay)))
        }

        fn try_finish_load_object(&mut self, request: usize) -> LoadStatus {
            match self.requests.get(request) {
                None => return LoadStatus::NotFound,
                Some((_, remaining)) if *remaining > 0 => return LoadStatus::Pending,
                Some(_) => {}
            }

            let (path, _) = self.requests.remove(request);
            if self.fail {
                return LoadStatus::Failed(LoadError::Interrupted {
                    path: PathBuf::from("memory"),
                });
            }
            match self.records.get(&path) {
                None => LoadStatus::NotFound,
                Some(record) => LoadStatus::Loaded(record.clone()),
            }
        }

        fn tick(&mut self) {
            for (_, (_, remaining)) in self.requests.iter_mut() {
                *remaining = remaining.saturating_sub(1);
            }
        }

        fn is_source_package_file(&self) -> bool {
            self.source
        }

        fn file_timestamp(&self) -> Timestamp {
            self.timestamp
        }
    }

    struct MemoryFactory {
        loaders: HashMap<AssetPath, SharedPackageLoader>,
    }

    impl PackageLoaderFactory for MemoryFactory {
        fn open(&self, package_path: &AssetPath) -> Option<SharedPackageLoader> {
            self.loaders.get(package_path).cloned()
        }
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S> tracing_subscriber::Layer<S> for WarnCounter
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
        let counter = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(counter.clone()));
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, counter.load(Ordering::Relaxed))
    }

    fn path(s: &str) -> AssetPath {
        AssetPath::parse(s).unwrap()
    }

    fn record(p: &str, resource: Option<&str>, flags: AssetFlags) -> AssetRecord {
        AssetRecord {
            path: path(p),
            type_name: "Thing".to_owned(),
            flags,
            resource_type: resource.map(str::to_owned),
            fields: toml::Table::new(),
        }
    }

    /// Creates file with given modification time in milliseconds.
    fn touch(file: &Path, millis: u64) {
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        let f = std::fs::File::create(file).unwrap();
        f.set_modified(UNIX_EPOCH + Duration::from_millis(millis))
            .unwrap();
    }

    struct Fixture {
        dir: tempfile::TempDir,
        loader: Arc<ObjectLoader>,
        preprocessor: Arc<RecordingPreprocessor>,
        begun: Arc<AtomicUsize>,
    }

    struct MemoryPackage {
        path: &'static str,
        timestamp: Timestamp,
        source: bool,
        delay: usize,
        fail: bool,
        records: Vec<AssetRecord>,
    }

    impl MemoryPackage {
        fn new(path: &'static str, timestamp: Timestamp, records: Vec<AssetRecord>) -> Self {
            MemoryPackage {
                path,
                timestamp,
                source: true,
                delay: 0,
                fail: false,
                records,
            }
        }
    }

    fn fixture(packages: Vec<MemoryPackage>, with_preprocessor: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Data")).unwrap();
        let config = Config::new(dir.path(), ConfigInfo::default()).unwrap();

        let begun = Arc::new(AtomicUsize::new(0));
        let loaders = packages
            .into_iter()
            .map(|package_desc| {
                let package = path(package_desc.path);
                let loader = share_loader(MemoryLoader {
                    package: package.clone(),
                    records: package_desc
                        .records
                        .into_iter()
                        .map(|record| (record.path.clone(), record))
                        .collect(),
                    source: package_desc.source,
                    timestamp: package_desc.timestamp,
                    delay: package_desc.delay,
                    fail: package_desc.fail,
                    requests: Slab::new(),
                    begun: begun.clone(),
                });
                (package, loader)
            })
            .collect();

        let preprocessor = Arc::new(RecordingPreprocessor::default());
        let slot = if with_preprocessor {
            InstanceSlot::with_instance(preprocessor.clone() as Arc<dyn ObjectPreprocessor>)
        } else {
            InstanceSlot::new()
        };

        let loader = ObjectLoader::new(
            &config,
            Box::new(MemoryFactory { loaders }),
            Arc::new(slot),
        );

        Fixture {
            dir,
            loader: Arc::new(loader),
            preprocessor,
            begun,
        }
    }

    impl Fixture {
        fn data(&self, relative: &str) -> PathBuf {
            self.dir.path().join("Data").join(relative)
        }

        fn load(&self, p: &str) -> AssetIndex {
            self.loader.load_object(&path(p)).unwrap()
        }
    }

    #[test]
    fn test_initialize_static_instance_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), ConfigInfo::default()).unwrap();
        let preprocessor = Arc::new(InstanceSlot::<dyn ObjectPreprocessor>::new());

        let slot = InstanceSlot::new();
        assert!(ObjectLoader::initialize_static_instance(
            &slot,
            &config,
            preprocessor.clone()
        ));
        let first = slot.get().unwrap();

        assert!(!ObjectLoader::initialize_static_instance(
            &slot,
            &config,
            preprocessor
        ));
        assert!(Arc::ptr_eq(&first, &slot.get().unwrap()));
    }

    #[test]
    fn test_plain_object_uses_package_timestamp() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Thing", None, AssetFlags::empty())],
            )],
            true,
        );

        let thing = f.load("/P:Thing");
        assert_eq!(f.preprocessor.events(), [Event::Cache(path("/P:Thing"), 100, true)]);

        assert!(f.loader.cache_object(thing, false));
        assert_eq!(
            f.preprocessor.cached().last(),
            Some(&(path("/P:Thing"), 100, false))
        );
    }

    #[test]
    fn test_newer_source_file_raises_timestamp() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:group:sub", Some("texture"), AssetFlags::empty())],
            )],
            true,
        );
        touch(&f.data("P/group"), 150);

        let sub = f.load("/P:group:sub");
        assert_eq!(
            f.preprocessor.events(),
            [
                Event::Precache(path("/P:group:sub"), 100),
                Event::Cache(path("/P:group:sub"), 150, true),
            ]
        );

        assert!(f.loader.cache_object(sub, true));
        assert_eq!(
            f.preprocessor.cached().last(),
            Some(&(path("/P:group:sub"), 150, true))
        );
    }

    #[test]
    fn test_older_source_file_keeps_package_timestamp() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:group:sub", Some("texture"), AssetFlags::empty())],
            )],
            true,
        );
        touch(&f.data("P/group"), 50);

        let sub = f.load("/P:group:sub");
        assert!(f.loader.cache_object(sub, true));
        assert_eq!(
            f.preprocessor.cached(),
            [
                (path("/P:group:sub"), 100, true),
                (path("/P:group:sub"), 100, true),
            ]
        );
    }

    #[test]
    fn test_broken_and_packages_not_cached() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![
                    record("/P:Broken", None, AssetFlags::BROKEN),
                    record(
                        "/P:BrokenTemplate",
                        None,
                        AssetFlags::BROKEN | AssetFlags::DEFAULT_TEMPLATE,
                    ),
                ],
            )],
            true,
        );

        let broken = f.load("/P:Broken");
        let template = f.load("/P:BrokenTemplate");
        let package = f.load("/P");

        assert!(f.loader.assets().get(package).unwrap().is_package());
        assert!(!f.loader.cache_object(broken, true));
        assert!(!f.loader.cache_object(template, false));
        assert!(!f.loader.cache_object(package, true));
        assert!(f.preprocessor.events().is_empty());
    }

    #[test]
    fn test_config_subtree_not_cached() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/Config",
                100,
                vec![
                    record("/Config:Graphics", None, AssetFlags::empty()),
                    record("/Config:Graphics:Quality", None, AssetFlags::empty()),
                ],
            )],
            true,
        );

        let graphics = f.load("/Config:Graphics");
        let quality = f.load("/Config:Graphics:Quality");
        assert!(!f.loader.cache_object(graphics, true));
        assert!(!f.loader.cache_object(quality, false));
        assert!(f.preprocessor.events().is_empty());

        // Plain object sitting exactly at the config package path.
        let f = fixture(vec![], true);
        let config = f
            .loader
            .assets_mut()
            .insert(Asset::new(path("/Config"), "Thing", AssetKind::Object))
            .unwrap();
        assert!(!f.loader.cache_object(config, true));
        assert!(f.preprocessor.events().is_empty());
    }

    #[test]
    fn test_default_template_not_cached_or_precached() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record(
                    "/P:Default",
                    Some("texture"),
                    AssetFlags::DEFAULT_TEMPLATE,
                )],
            )],
            true,
        );
        touch(&f.data("P/Default"), 10);

        let default = f.load("/P:Default");
        let loader = f.loader.get_package_loader(&path("/P:Default")).unwrap();
        assert!(!f.loader.on_precache_ready(default, &loader));
        assert!(!f.loader.cache_object(default, true));
        assert!(f.preprocessor.events().is_empty());
    }

    #[test]
    fn test_precache_skips_non_resources() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![
                    record("/P:Thing", None, AssetFlags::empty()),
                    record("/P:Tex", Some("texture"), AssetFlags::empty()),
                ],
            )],
            true,
        );
        touch(&f.data("P/Tex"), 10);

        let thing = f.load("/P:Thing");
        let tex = f.load("/P:Tex");
        let loader = f.loader.get_package_loader(&path("/P")).unwrap();

        assert!(!f.loader.on_precache_ready(thing, &loader));
        assert!(f.loader.on_precache_ready(tex, &loader));

        let precached: Vec<_> = f
            .preprocessor
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Precache(..)))
            .collect();
        assert_eq!(
            precached,
            [
                Event::Precache(path("/P:Tex"), 100),
                Event::Precache(path("/P:Tex"), 100),
            ]
        );
        assert!(f
            .loader
            .assets()
            .get(tex)
            .unwrap()
            .as_resource()
            .unwrap()
            .preprocessed()
            .is_some());
    }

    #[test]
    fn test_missing_preprocessor_warns_once_per_call() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Tex", Some("texture"), AssetFlags::empty())],
            )],
            false,
        );
        touch(&f.data("P/Tex"), 10);

        let (tex, _) = count_warnings(|| f.load("/P:Tex"));
        let loader = f.loader.get_package_loader(&path("/P")).unwrap();

        let (cached, warnings) = count_warnings(|| f.loader.cache_object(tex, true));
        assert!(!cached);
        assert_eq!(warnings, 1);

        let (precached, warnings) = count_warnings(|| f.loader.on_precache_ready(tex, &loader));
        assert!(!precached);
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_preprocessor_installed_later() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Thing", None, AssetFlags::empty())],
            )],
            false,
        );

        let thing = f.load("/P:Thing");
        assert!(!f.loader.cache_object(thing, true));

        assert!(f
            .loader
            .preprocessor()
            .initialize(f.preprocessor.clone() as Arc<dyn ObjectPreprocessor>));
        assert!(f.loader.cache_object(thing, true));
        assert_eq!(f.preprocessor.cached(), [(path("/P:Thing"), 100, true)]);
    }

    #[test]
    fn test_missing_source_file_fails() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Tex", Some("texture"), AssetFlags::empty())],
            )],
            true,
        );

        let (tex, _) = count_warnings(|| f.load("/P:Tex"));
        let (cached, warnings) = count_warnings(|| f.loader.cache_object(tex, true));
        assert!(!cached);
        assert_eq!(warnings, 1);
        assert!(f.preprocessor.cached().is_empty());
    }

    #[test]
    fn test_missing_data_directory_fails() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![
                    record("/P:Tex", Some("texture"), AssetFlags::empty()),
                    record("/P:Thing", None, AssetFlags::empty()),
                ],
            )],
            true,
        );
        std::fs::remove_dir(f.data("")).unwrap();

        let tex = f.load("/P:Tex");
        let thing = f.load("/P:Thing");
        assert!(!f.loader.cache_object(tex, true));

        // Plain objects don't need the data directory.
        assert!(f.loader.cache_object(thing, true));
    }

    #[test]
    fn test_preprocessor_failure_is_reported() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Thing", None, AssetFlags::empty())],
            )],
            true,
        );
        f.preprocessor.fail.store(true, Ordering::Relaxed);

        let thing = f.load("/P:Thing");
        assert!(!f.loader.cache_object(thing, true));
        assert_eq!(f.preprocessor.cached().len(), 2);
    }

    #[test]
    fn test_in_flight_loads_are_shared() {
        let mut package_desc = MemoryPackage::new(
            "/P",
            100,
            vec![record("/P:Thing", None, AssetFlags::empty())],
        );
        package_desc.delay = 3;
        let f = fixture(vec![package_desc], true);

        let first = f.loader.begin_load_object(&path("/P:Thing"));
        let second = f.loader.begin_load_object(&path("/P:Thing"));
        assert_eq!(first, second);
        assert_eq!(f.begun.load(Ordering::Relaxed), 1);

        assert_eq!(f.loader.try_finish_load(first), Poll::Pending);
        f.loader.tick();
        f.loader.tick();
        assert_eq!(f.loader.try_finish_load(first), Poll::Pending);
        f.loader.tick();

        let Poll::Ready(Some(a)) = f.loader.try_finish_load(first) else {
            panic!("First holder must get the object");
        };
        let Poll::Ready(Some(b)) = f.loader.try_finish_load(second) else {
            panic!("Second holder must get the object");
        };
        assert_eq!(a, b);

        // Loaded once, cached once.
        assert_eq!(f.preprocessor.cached().len(), 1);

        // Already loaded objects complete without touching the loader.
        let third = f.loader.begin_load_object(&path("/P:Thing"));
        assert_eq!(f.loader.try_finish_load(third), Poll::Ready(Some(a)));
        assert_eq!(f.begun.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_not_found_and_failures() {
        let mut failing = MemoryPackage::new("/Bad", 1, vec![]);
        failing.fail = true;
        let f = fixture(
            vec![MemoryPackage::new("/P", 100, vec![]), failing],
            true,
        );

        assert_eq!(f.loader.load_object(&path("/P:Missing")), None);
        assert_eq!(f.loader.load_object(&path("/Bad:Thing")), None);

        let (result, warnings) = count_warnings(|| f.loader.load_object(&path("/Nowhere:Thing")));
        assert_eq!(result, None);
        assert_eq!(warnings, 1);

        assert!(f.preprocessor.events().is_empty());

        // Failed path may be requested again.
        assert_eq!(f.loader.load_object(&path("/Bad:Thing")), None);
        assert_eq!(f.begun.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_ownership_resolves_to_package() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![
                    record("/P:group", None, AssetFlags::empty()),
                    record("/P:group:sub", None, AssetFlags::empty()),
                ],
            )],
            true,
        );

        let group = f.load("/P:group");
        let sub = f.load("/P:group:sub");

        let assets = f.loader.assets();
        let package = assets.find(&path("/P")).unwrap();
        assert_eq!(assets.get(sub).unwrap().owner(), Some(group));
        assert_eq!(assets.get(group).unwrap().owner(), Some(package));
        assert_eq!(assets.owning_package(sub), Some(package));
    }

    #[test]
    fn test_equal_source_timestamp_keeps_package_timestamp() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:group:sub", Some("texture"), AssetFlags::empty())],
            )],
            true,
        );
        touch(&f.data("P/group"), 100);

        let sub = f.load("/P:group:sub");
        assert!(f.loader.cache_object(sub, false));
        assert_eq!(
            f.preprocessor.cached(),
            [
                (path("/P:group:sub"), 100, true),
                (path("/P:group:sub"), 100, false),
            ]
        );
    }

    #[test]
    fn test_concurrent_ticks_deliver_object() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Thing", None, AssetFlags::empty())],
            )],
            true,
        );
        *f.preprocessor.delay.lock() = Duration::from_millis(200);

        let id = f.loader.begin_load_object(&path("/P:Thing"));

        std::thread::scope(|scope| {
            let first = scope.spawn(|| f.loader.tick());
            std::thread::sleep(Duration::from_millis(20));
            let second = scope.spawn(|| f.loader.tick());
            first.join().unwrap();
            second.join().unwrap();
        });

        let index = f.loader.assets().find(&path("/P:Thing"));
        assert!(index.is_some());
        assert_eq!(f.loader.try_finish_load(id), Poll::Ready(index));
        assert_eq!(f.preprocessor.cached().len(), 1);
    }

    #[test]
    fn test_table_unlocked_during_preprocessing() {
        let f = fixture(
            vec![MemoryPackage::new(
                "/P",
                100,
                vec![record("/P:Tex", Some("texture"), AssetFlags::empty())],
            )],
            true,
        );
        touch(&f.data("P/Tex"), 10);
        *f.preprocessor.observed.lock() = Some(Arc::downgrade(&f.loader));

        let tex = f.load("/P:Tex");

        // Precache, then cache.
        assert_eq!(*f.preprocessor.table_unlocked.lock(), [true, true]);
        assert!(f
            .loader
            .assets()
            .get(tex)
            .unwrap()
            .as_resource()
            .unwrap()
            .preprocessed()
            .is_some());

        *f.preprocessor.delay.lock() = Duration::from_millis(200);
        let loader = f.loader.get_package_loader(&path("/P")).unwrap();
        let start = Instant::now();

        std::thread::scope(|scope| {
            let precache = scope.spawn(|| f.loader.on_precache_ready(tex, &loader));
            std::thread::sleep(Duration::from_millis(20));

            // Readers are not stalled by preprocessing.
            assert_eq!(f.loader.assets_mut().len(), 2);
            assert!(start.elapsed() < Duration::from_millis(200));
            assert!(precache.join().unwrap());
        });
    }

    /// Passes source through and counts calls.
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    impl ResourceHandler for CountingHandler {
        fn resource_type(&self) -> &str {
            "text"
        }

        fn preprocess(
            &self,
            source: &[u8],
            _platform: &str,
        ) -> Result<Box<[u8]>, PreprocessError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(source.into())
        }
    }

    fn set_timestamp(file: &Path, millis: u64) {
        std::fs::File::options()
            .write(true)
            .open(file)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_millis(millis))
            .unwrap();
    }

    /// Writes `/Notes` package at 100 with `hello.txt` source at 200.
    fn write_notes(dir: &tempfile::TempDir) -> Config {
        let data = dir.path().join("Data");

        std::fs::create_dir_all(data.join("Notes")).unwrap();
        std::fs::write(
            data.join("Notes.toml"),
            r#"
[[object]]
name = "hello.txt"
type = "Note"
resource = "text"

[[object]]
name = "Readme"
type = "Note"

[object.fields]
title = "readme"
"#,
        )
        .unwrap();
        std::fs::write(data.join("Notes/hello.txt"), b"hello").unwrap();

        set_timestamp(&data.join("Notes.toml"), 100);
        set_timestamp(&data.join("Notes/hello.txt"), 200);

        Config::new(dir.path(), ConfigInfo::default()).unwrap()
    }

    fn disk_preprocessor(
        config: &Config,
        calls: &Arc<AtomicUsize>,
    ) -> Arc<DiskObjectPreprocessor> {
        let mut disk = DiskObjectPreprocessor::new(config);
        disk.register_handler(Box::new(CountingHandler {
            calls: calls.clone(),
        }));
        Arc::new(disk)
    }

    #[test]
    fn test_archive_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_notes(&dir);

        let calls = Arc::new(AtomicUsize::new(0));
        let disk = disk_preprocessor(&config, &calls);
        let preprocessor = Arc::new(InstanceSlot::<dyn ObjectPreprocessor>::with_instance(
            disk.clone(),
        ));

        let slot = InstanceSlot::new();
        assert!(ObjectLoader::initialize_static_instance(
            &slot,
            &config,
            preprocessor
        ));
        let loader = slot.get().unwrap();

        let hello = loader.load_object(&path("/Notes:hello.txt")).unwrap();
        let readme = loader.load_object(&path("/Notes:Readme")).unwrap();

        {
            let assets = loader.assets();
            let hello = assets.get(hello).unwrap().as_resource().unwrap();
            assert_eq!(hello.preprocessed(), Some(&b"hello"[..]));
            assert_eq!(
                assets.get(readme).unwrap().fields().get("title"),
                Some(&toml::Value::String("readme".to_owned()))
            );
        }

        assert!(disk.is_fresh(&path("/Notes:hello.txt"), 200));
        assert!(disk.is_fresh(&path("/Notes:Readme"), 100));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // Payload is keyed by the newer source timestamp and survives eviction.
        let hello = path("/Notes:hello.txt");
        assert!(disk.payload_path(&hello, "pc", 200).unwrap().exists());
        assert!(!disk.payload_path(&hello, "pc", 100).unwrap().exists());
    }

    #[test]
    fn test_newer_source_payload_reused_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_notes(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let hello = path("/Notes:hello.txt");

        for _ in 0..3 {
            let disk = disk_preprocessor(&config, &calls);
            let preprocessor = Arc::new(InstanceSlot::<dyn ObjectPreprocessor>::with_instance(
                disk.clone(),
            ));
            let loader = ObjectLoader::archive(&config, preprocessor);

            let index = loader.load_object(&hello).unwrap();
            assert_eq!(
                loader
                    .assets()
                    .get(index)
                    .unwrap()
                    .as_resource()
                    .unwrap()
                    .preprocessed(),
                Some(&b"hello"[..])
            );

            assert!(disk.is_fresh(&hello, 200));
            assert!(disk.payload_path(&hello, "pc", 200).unwrap().exists());
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
