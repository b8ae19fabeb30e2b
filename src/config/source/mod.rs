pub mod cached;
pub mod fs;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cached::CachedConfigSource;
use fs::FileSystemConfigSource;
use lazy_static::lazy_static;
use tokio::sync::RwLock;

use super::{boot::BootParams, global::GlobalConfig};

#[async_trait]
pub trait ConfigSource {
    fn source_debug_string(&self) -> String;

    async fn get_global_config(&self) -> Result<Option<GlobalConfig>>;

    /// Label of the filesystem holding the overlay.
    async fn get_overlay_label(&self) -> Result<String>;

    async fn get_boot_params(&self) -> Result<BootParams>;
}

pub type SharedConfigSource = Arc<dyn ConfigSource + Send + Sync>;

lazy_static! {
    static ref ROOTDISK_CONFIG_SOURCE: RwLock<SharedConfigSource> =
        RwLock::new(Arc::new(CachedConfigSource::new(
            FileSystemConfigSource::new_with_default_config_dir()
        )) as SharedConfigSource);
}

pub async fn set_config_source(config_source: impl ConfigSource + Send + Sync + 'static) {
    *(ROOTDISK_CONFIG_SOURCE.write().await) = Arc::new(config_source) as SharedConfigSource;
}

pub async fn get_config_source() -> SharedConfigSource {
    ROOTDISK_CONFIG_SOURCE.read().await.clone()
}
