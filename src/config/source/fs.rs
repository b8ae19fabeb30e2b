use anyhow::{Context as _, Result};
use async_trait::async_trait;

use std::path::{Path, PathBuf};

use crate::config::boot::{parse_overlay_label, BootParams};

use super::super::global::GlobalConfig;
use super::ConfigSource;

pub const ROOTDISK_CONFIG_DIR_DEFAULT: &str = "/etc/rootdisk";
pub const OVERLAY_LABEL_FILE_DEFAULT: &str = "/tmp/overlay_partition";
pub const KERNEL_CMDLINE_FILE_DEFAULT: &str = "/proc/cmdline";

pub struct FileSystemConfigSource {
    config_dir: PathBuf,
    label_file: PathBuf,
    cmdline_file: PathBuf,
}

impl FileSystemConfigSource {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            label_file: PathBuf::from(OVERLAY_LABEL_FILE_DEFAULT),
            cmdline_file: PathBuf::from(KERNEL_CMDLINE_FILE_DEFAULT),
        }
    }

    pub fn new_with_default_config_dir() -> Self {
        Self::new(PathBuf::from(ROOTDISK_CONFIG_DIR_DEFAULT))
    }

    /// Read the overlay label and the kernel command line from other files.
    pub fn with_boot_files(
        mut self,
        label_file: impl Into<PathBuf>,
        cmdline_file: impl Into<PathBuf>,
    ) -> Self {
        self.label_file = label_file.into();
        self.cmdline_file = cmdline_file.into();
        self
    }

    async fn read_optional(path: &Path) -> Option<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(content) => Some(content),
            Err(error) => {
                tracing::debug!(?path, ?error, "Cannot read file, skip");
                None
            }
        }
    }
}

#[async_trait]
impl ConfigSource for FileSystemConfigSource {
    fn source_debug_string(&self) -> String {
        format!(
            "filesystem: {:?} (label: {:?}, cmdline: {:?})",
            self.config_dir, self.label_file, self.cmdline_file
        )
    }

    async fn get_global_config(&self) -> Result<Option<GlobalConfig>> {
        let config_path = self.config_dir.join("global.toml");

        tracing::debug!("Loading global config from: {config_path:?}");
        if !config_path.exists() {
            tracing::debug!("global config not found, skip: {config_path:?}");
            return Ok(None);
        }

        let global_config = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                toml::from_str::<GlobalConfig>(&content).context("Failed to parse content as TOML")
            })
            .with_context(|| format!("Failed to load global config from: {config_path:?}"))?;

        Ok(Some(global_config))
    }

    async fn get_overlay_label(&self) -> Result<String> {
        let raw = Self::read_optional(&self.label_file).await;
        Ok(parse_overlay_label(raw.as_deref()))
    }

    async fn get_boot_params(&self) -> Result<BootParams> {
        let Some(raw) = Self::read_optional(&self.cmdline_file).await else {
            return Ok(BootParams::default());
        };
        Ok(BootParams::from_cmdline(&String::from_utf8_lossy(&raw)))
    }
}
