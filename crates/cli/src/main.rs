use std::{path::PathBuf, sync::Arc};

use cask::{
    AssetPath, Config, ConfigInfo, DiskObjectPreprocessor, InstanceSlot, ObjectLoader,
    ObjectPreprocessor, PassthroughHandler, CONFIG_FILE_NAME,
};
use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Writes config file with default settings.
    Init {
        #[arg(value_name = "path", default_value = ".")]
        path: PathBuf,

        #[arg(long = "platform", value_name = "platform")]
        platforms: Vec<String>,
    },

    /// Loads objects and updates the cache.
    Load {
        #[arg(value_name = "asset-path", required = true)]
        paths: Vec<AssetPath>,

        /// Config file to use instead of searching from current directory.
        #[arg(long = "config", value_name = "path")]
        config: Option<PathBuf>,

        /// Resource type whose source data is used as is.
        #[arg(long = "passthrough", value_name = "resource-type")]
        passthrough: Vec<String>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "cask")]
#[command(about = "Asset object loading and caching tool")]
#[command(rename_all = "kebab-case")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn main() -> miette::Result<()> {
    install_tracing_subscriber();

    let cli = Cli::parse();

    match cli.command {
        Command::Init { path, platforms } => init(path, platforms)?,
        Command::Load {
            paths,
            config,
            passthrough,
        } => load(paths, config, passthrough)?,
    }

    Ok(())
}

fn init(path: PathBuf, platforms: Vec<String>) -> miette::Result<()> {
    let config_path = path.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        miette::bail!("Config file '{}' already exists", config_path.display());
    }

    let info = ConfigInfo {
        data: Some(PathBuf::from("Data")),
        cache: Some(PathBuf::from("Cache")),
        config_package: Some(AssetPath::parse("/Config").into_diagnostic()?),
        platforms: if platforms.is_empty() {
            vec!["pc".to_owned()]
        } else {
            platforms
        },
    };

    // Validate before writing.
    Config::new(&path, info.clone()).into_diagnostic()?;

    std::fs::create_dir_all(path.join("Data")).into_diagnostic()?;
    info.write(&config_path).into_diagnostic()?;

    tracing::info!("Created '{}'", config_path.display());
    Ok(())
}

fn load(
    paths: Vec<AssetPath>,
    config: Option<PathBuf>,
    passthrough: Vec<String>,
) -> miette::Result<()> {
    let config = match config {
        Some(path) => Config::open(&path),
        None => Config::find_current(),
    }
    .into_diagnostic()?;

    let mut disk = DiskObjectPreprocessor::new(&config);
    for resource_type in passthrough {
        disk.register_handler(Box::new(PassthroughHandler::new(resource_type)));
    }
    let preprocessor: Arc<dyn ObjectPreprocessor> = Arc::new(disk);

    let loader = InstanceSlot::new();
    ObjectLoader::initialize_static_instance(
        &loader,
        &config,
        Arc::new(InstanceSlot::with_instance(preprocessor)),
    );
    let loader = loader
        .get()
        .ok_or_else(|| miette::miette!("Object loader is not initialized"))?;

    let mut missing = 0;
    for path in &paths {
        match loader.load_object(path) {
            None => {
                println!("{path}: not loaded");
                missing += 1;
            }
            Some(index) => {
                let assets = loader.assets();
                let Some(asset) = assets.get(index) else {
                    continue;
                };

                let mut line = format!("{path}: {} {}", index, asset.type_name());
                if let Some(resource) = asset.as_resource() {
                    line.push_str(&format!(" [{}]", resource.resource_type()));
                    if let Some(data) = resource.preprocessed() {
                        line.push_str(&format!(" {} bytes", data.len()));
                    }
                }
                if !asset.flags().is_empty() {
                    line.push_str(&format!(" {:?}", asset.flags()));
                }
                println!("{line}");
            }
        }
    }

    if missing > 0 {
        miette::bail!("{} of {} objects failed to load", missing, paths.len());
    }

    Ok(())
}

fn install_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt as _;
    if let Err(err) = tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    ) {
        panic!("Failed to install tracing subscriber: {}", err);
    }
}
