pub mod loop_dev;

use std::{
    os::unix::fs::{FileTypeExt as _, MetadataExt as _},
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use tokio::sync::RwLock;

/// Root devices on raw flash are handled by the mtd/ubi drivers.
const FLASH_DEVICE_MARKERS: [&str; 2] = ["mtdblock", "ubiblock"];

pub fn is_flash_device(dev: &Path) -> bool {
    let dev = dev.to_string_lossy();
    FLASH_DEVICE_MARKERS
        .iter()
        .any(|marker| dev.contains(marker))
}

/// Device number of the block device backing `path`: the device itself for
/// block special files, the containing filesystem's device otherwise.
pub async fn device_number_of(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {path:?}"))?;

    Ok(if metadata.file_type().is_block_device() {
        metadata.rdev()
    } else {
        metadata.dev()
    })
}

/// Scan `dev_dir` for the block special file with device number `devno`.
pub async fn find_block_device(dev_dir: &Path, devno: u64) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dev_dir)
        .await
        .with_context(|| format!("Failed to list {dev_dir:?}"))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Ok(metadata) = tokio::fs::symlink_metadata(&path).await else {
            continue;
        };

        if metadata.file_type().is_block_device() && metadata.rdev() == devno {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// Finds the block device holding the root filesystem, and remembers it for
/// the rest of the process.
pub struct RootDeviceResolver {
    dev_dir: PathBuf,
    mount_points: Vec<PathBuf>,
    resolved: RwLock<Option<PathBuf>>,
}

impl RootDeviceResolver {
    pub fn new(dev_dir: impl Into<PathBuf>, mount_points: Vec<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            mount_points,
            resolved: RwLock::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_resolved(dev: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            mount_points: vec![],
            resolved: RwLock::new(Some(dev.into())),
        }
    }

    /// The root block device, or `None` if it cannot be found or lives on
    /// flash.
    pub async fn resolve(&self) -> Option<PathBuf> {
        let dev = self.resolve_cached().await?;

        if is_flash_device(&dev) {
            tracing::debug!(?dev, "Root device is a flash device, not handled here");
            return None;
        }

        Some(dev)
    }

    async fn resolve_cached(&self) -> Option<PathBuf> {
        let read = self.resolved.read().await;
        if let Some(dev) = &*read {
            return Some(dev.clone());
        }
        drop(read);

        let mut write = self.resolved.write().await;
        if let Some(dev) = &*write {
            return Some(dev.clone());
        }

        for mount_point in &self.mount_points {
            match self.resolve_mount_point(mount_point).await {
                Ok(Some(dev)) => {
                    tracing::debug!(?mount_point, ?dev, "Resolved root device");
                    *write = Some(dev.clone());
                    return Some(dev);
                }
                Ok(None) => {
                    tracing::debug!(?mount_point, "No block device found for mount point")
                }
                Err(error) => {
                    tracing::debug!(?mount_point, ?error, "Failed to resolve mount point")
                }
            }
        }

        None
    }

    async fn resolve_mount_point(&self, mount_point: &Path) -> Result<Option<PathBuf>> {
        let devno = device_number_of(mount_point).await?;
        find_block_device(&self.dev_dir, devno).await
    }
}
