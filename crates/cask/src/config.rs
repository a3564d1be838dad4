//! Configuration of the loading pipeline.
//!
//! Configuration is read from `cask.toml` file.
//! All paths in the file are relative to the directory containing it.
//!
//! ```toml
//! data = "Data"
//! cache = "Cache"
//! config_package = "/Config"
//! platforms = ["pc"]
//! ```

use std::path::{Path, PathBuf};

use crate::{
    files::FileLocations,
    path::{AssetPath, ParsePathError},
};

pub const CONFIG_FILE_NAME: &'static str = "cask.toml";

const DEFAULT_DATA: &'static str = "Data";
const DEFAULT_CACHE: &'static str = "Cache";
const DEFAULT_CONFIG_PACKAGE: &'static str = "/Config";
const DEFAULT_PLATFORM: &'static str = "pc";

/// Configuration as stored in the file.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigInfo {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_package: Option<AssetPath>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub platforms: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to find current working directory. {error}")]
    NoCwd { error: std::io::Error },

    #[error("Failed to find config file in ancestors of '{path}'")]
    NotFound { path: PathBuf },

    #[error("Failed to read config file '{path}'. {error}")]
    ReadError {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to write config file '{path}'. {error}")]
    WriteError {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to deserialize config file '{path}'. {error}")]
    DeserializeError {
        error: toml::de::Error,
        path: PathBuf,
    },

    #[error("Failed to serialize config file '{path}'. {error}")]
    SerializeError {
        error: toml::ser::Error,
        path: PathBuf,
    },

    #[error("Config package path must not be empty")]
    EmptyConfigPackage,

    #[error("Config package path '{path}' does not name a package")]
    ConfigPackageNotPackage { path: AssetPath },

    #[error("At least one platform must be configured")]
    NoPlatforms,

    #[error(transparent)]
    InvalidPath(#[from] ParsePathError),
}

impl ConfigInfo {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|error| ConfigError::ReadError {
            error,
            path: path.to_owned(),
        })?;
        let info = toml::from_str(&data).map_err(|error| ConfigError::DeserializeError {
            error,
            path: path.to_owned(),
        })?;
        Ok(info)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let data = toml::to_string_pretty(self).map_err(|error| ConfigError::SerializeError {
            error,
            path: path.to_owned(),
        })?;
        std::fs::write(path, data.as_bytes()).map_err(|error| ConfigError::WriteError {
            error,
            path: path.to_owned(),
        })?;
        Ok(())
    }
}

/// Resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    data: PathBuf,
    cache: PathBuf,
    boundary: ConfigBoundary,
    platforms: Vec<String>,
}

impl Config {
    /// Find and open config in ancestors of specified directory.
    #[tracing::instrument]
    pub fn find(path: &Path) -> Result<Self, ConfigError> {
        let config_path = path
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::NotFound {
                path: path.to_owned(),
            })?;

        Config::open(&config_path)
    }

    /// Find and open config in ancestors of current directory.
    pub fn find_current() -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|error| ConfigError::NoCwd { error })?;
        Config::find(&cwd)
    }

    /// Open config file at specified path.
    #[tracing::instrument]
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let info = ConfigInfo::read(path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        Config::new(base, info)
    }

    /// Resolves config info relative to `base` directory.
    pub fn new(base: &Path, info: ConfigInfo) -> Result<Self, ConfigError> {
        let data = base.join(info.data.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA)));
        let cache = base.join(info.cache.unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE)));

        let config_package = match info.config_package {
            Some(path) => path,
            None => AssetPath::parse(DEFAULT_CONFIG_PACKAGE)?,
        };
        let boundary = ConfigBoundary::new(config_package)?;

        let platforms = if info.platforms.is_empty() {
            vec![DEFAULT_PLATFORM.to_owned()]
        } else {
            info.platforms
        };

        if platforms.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::NoPlatforms);
        }

        Ok(Config {
            data,
            cache,
            boundary,
            platforms,
        })
    }

    pub fn locations(&self) -> FileLocations {
        FileLocations::new(self.data.clone(), self.cache.clone())
    }

    pub fn boundary(&self) -> &ConfigBoundary {
        &self.boundary
    }

    /// Platforms to preprocess resources for.
    /// Never empty.
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Platform whose preprocessed data is attached to loaded resources.
    pub fn primary_platform(&self) -> &str {
        &self.platforms[0]
    }
}

/// Reserved package subtree holding configuration objects.
///
/// Nothing inside it is ever cached.
#[derive(Clone, Debug)]
pub struct ConfigBoundary {
    package: AssetPath,
}

impl ConfigBoundary {
    pub fn new(package: AssetPath) -> Result<Self, ConfigError> {
        if package.is_empty() {
            return Err(ConfigError::EmptyConfigPackage);
        }
        if !package.is_package() {
            return Err(ConfigError::ConfigPackageNotPackage { path: package });
        }
        Ok(ConfigBoundary { package })
    }

    pub fn config_package_path(&self) -> &AssetPath {
        &self.package
    }

    /// Returns true if `path` is the config package or lies beneath it.
    pub fn contains(&self, path: &AssetPath) -> bool {
        path.ancestors().any(|ancestor| ancestor == self.package)
    }
}
