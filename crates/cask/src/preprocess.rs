use crate::{
    asset::{Asset, Resource},
    files::Timestamp,
    path::AssetPath,
};

/// Owner of persistent object cache and platform-specific resource preparation.
pub trait ObjectPreprocessor: Send + Sync + 'static {
    /// Stores preprocessed form of the object keyed by its path and `timestamp`.
    ///
    /// With `evict_platform_preprocessed_resource_data` set,
    /// platform payloads not matching `timestamp` are removed.
    fn cache_object(
        &self,
        object: &Asset,
        timestamp: Timestamp,
        evict_platform_preprocessed_resource_data: bool,
    ) -> bool;

    /// Loads or prepares binary payload of the resource at `path`.
    fn load_resource_data(
        &self,
        path: &AssetPath,
        resource: &mut Resource,
        timestamp: Timestamp,
    ) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Platform '{platform}' is not supported")]
    UnsupportedPlatform { platform: String },

    #[error("Invalid source data. {reason}")]
    InvalidSource { reason: String },
}

/// Converts source data of one resource type into platform payloads.
pub trait ResourceHandler: Send + Sync + 'static {
    fn resource_type(&self) -> &str;

    fn preprocess(&self, source: &[u8], platform: &str) -> Result<Box<[u8]>, PreprocessError>;
}

/// Handler that uses source data as payload on every platform.
pub struct PassthroughHandler {
    resource_type: String,
}

impl PassthroughHandler {
    pub fn new(resource_type: impl Into<String>) -> Self {
        PassthroughHandler {
            resource_type: resource_type.into(),
        }
    }
}

impl ResourceHandler for PassthroughHandler {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn preprocess(&self, source: &[u8], _platform: &str) -> Result<Box<[u8]>, PreprocessError> {
        Ok(source.into())
    }
}
