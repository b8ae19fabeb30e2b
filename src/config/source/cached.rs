use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{boot::BootParams, global::GlobalConfig};

use super::ConfigSource;

/// Remembers every value after the first successful read from `inner`.
pub struct CachedConfigSource<T: ConfigSource + Sync> {
    inner: T,
    global: RwLock<Option<Option<GlobalConfig>>>,
    overlay_label: RwLock<Option<String>>,
    boot_params: RwLock<Option<BootParams>>,
}

impl<T: ConfigSource + Sync> CachedConfigSource<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            global: RwLock::new(None),
            overlay_label: RwLock::new(None),
            boot_params: RwLock::new(None),
        }
    }
}

macro_rules! cached {
    ($self:ident, $field:ident, $load:ident) => {{
        let read = $self.$field.read().await;
        if let Some(value) = &*read {
            return Ok(value.clone());
        }
        drop(read);

        let mut write = $self.$field.write().await;
        // Double check
        if let Some(value) = &*write {
            return Ok(value.clone());
        }

        let value = $self.inner.$load().await?;
        *write = Some(value.clone());
        Ok(value)
    }};
}

#[async_trait]
impl<T: ConfigSource + Sync> ConfigSource for CachedConfigSource<T> {
    fn source_debug_string(&self) -> String {
        self.inner.source_debug_string()
    }

    async fn get_global_config(&self) -> Result<Option<GlobalConfig>> {
        cached!(self, global, get_global_config)
    }

    async fn get_overlay_label(&self) -> Result<String> {
        cached!(self, overlay_label, get_overlay_label)
    }

    async fn get_boot_params(&self) -> Result<BootParams> {
        cached!(self, boot_params, get_boot_params)
    }
}
