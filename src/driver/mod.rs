pub mod rootdisk;

use anyhow::Result;
use async_trait::async_trait;

use crate::{config::source::SharedConfigSource, types::FilesystemKind};

use rootdisk::{RootDiskDriver, ROOTDISK_DRIVER_NAME};

/// A backend able to locate, prepare and probe the overlay volume.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    type Volume: Send + Sync;

    fn name(&self) -> &'static str;

    /// Look for the volume called `name`. `None` when this driver does not
    /// handle it on this system.
    async fn find(&self, name: &str) -> Option<Self::Volume>;

    /// Make the volume usable: expose it as a block device and create the
    /// overlay filesystem if there is none yet.
    async fn init(&self, volume: &mut Self::Volume) -> Result<()>;

    async fn identify(&self, volume: &Self::Volume) -> Result<FilesystemKind>;
}

/// Drivers known by name.
pub enum Driver {
    RootDisk(RootDiskDriver),
}

pub const DRIVER_NAMES: [&str; 1] = [ROOTDISK_DRIVER_NAME];

pub fn lookup(name: &str, config: SharedConfigSource) -> Option<Driver> {
    match name {
        ROOTDISK_DRIVER_NAME => Some(Driver::RootDisk(RootDiskDriver::new(config))),
        _ => {
            tracing::debug!(name, "No volume driver registered under this name");
            None
        }
    }
}
