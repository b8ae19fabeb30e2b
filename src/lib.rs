pub mod cli;
pub mod cmd;
pub mod config;
pub mod disk;
pub mod driver;
pub mod fs;
pub mod planner;
pub mod types;

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use config::source::{cached::CachedConfigSource, fs::FileSystemConfigSource};
use shadow_rs::shadow;
use tracing_subscriber::{
    layer::SubscriberExt as _, reload, util::SubscriberInitExt as _, EnvFilter, Registry,
};

shadow!(build);

type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

/// Log to stderr, `info` and up unless `RUST_LOG` says otherwise.
fn init_logging() -> LogFilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

fn enable_debug_logging(handle: &LogFilterHandle) -> Result<()> {
    handle
        .modify(|filter| {
            *filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into())
        })
        .context("Failed to update log level to DEBUG")?;
    tracing::info!("Log level set to DEBUG");
    Ok(())
}

pub async fn run() -> Result<()> {
    let log_filter = init_logging();
    let args = cli::Args::parse();

    if let Some(config_dir) = &args.config_dir {
        if !Path::new(config_dir).is_dir() {
            bail!("Config dir {config_dir} does not exist or not a directory")
        }
        config::source::set_config_source(CachedConfigSource::new(
            FileSystemConfigSource::new(config_dir),
        ))
        .await;
    }

    let config_source = config::source::get_config_source().await;
    if config_source
        .get_global_config()
        .await?
        .is_some_and(|global| global.verbose())
    {
        enable_debug_logging(&log_filter)?;
    }

    tracing::debug!(
        version = build::PKG_VERSION,
        commit = build::COMMIT_HASH,
        build_time = build::BUILD_TIME,
        config_source = %config_source.source_debug_string(),
        "rootdisk starting"
    );

    args.command.into_command().run().await
}
