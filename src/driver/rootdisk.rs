//! Overlay volume living on the disk that holds the squashfs root image.

use std::{fmt::Display, path::PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use block_devs::BlckExt as _;
use serde::Serialize;
use tokio::fs::File;

use crate::{
    config::source::SharedConfigSource,
    disk::{self, DiskInfo},
    fs::{
        block::{
            loop_dev::{self, KernelLoopSlots, LoopRequest, LoopSlots},
            RootDeviceResolver,
        },
        mkfs::{MakeFs, SystemMakeFs},
        probe::{self, SquashfsHeader},
        SystemPaths,
    },
    planner::{self, OverlayTarget, PartitionLabels, Placement, PlacementRequest},
    types::{FilesystemKind, MakeFsType},
};

use super::VolumeDriver;

pub const ROOTDISK_DRIVER_NAME: &str = "rootdisk";

/// Regions up to this size are always formatted as ext4.
pub const F2FS_MIN_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Found,
    Bound,
    Identified,
    Formatted,
    Ready,
}

impl Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootDiskVolume {
    /// Volume name, which is also the label of the overlay filesystem.
    pub name: String,
    pub root_device: PathBuf,
    pub target: OverlayTarget,
    pub creation_forbidden: bool,
    /// Block device the overlay is read from. Becomes the loop device once a
    /// region is bound, and is cleared when binding fails.
    pub device_name: Option<PathBuf>,
    /// Start of the overlay within `device_name`.
    pub byte_offset: u64,
    pub state: VolumeState,
}

impl RootDiskVolume {
    fn new(name: &str, root_device: PathBuf, placement: Placement) -> Self {
        Self {
            name: name.to_owned(),
            root_device,
            device_name: Some(placement.target.device().to_owned()),
            byte_offset: placement.target.offset(),
            target: placement.target,
            creation_forbidden: placement.creation_forbidden,
            state: VolumeState::Found,
        }
    }
}

pub struct RootDiskDriver<L = KernelLoopSlots, M = SystemMakeFs> {
    config: SharedConfigSource,
    paths: SystemPaths,
    resolver: RootDeviceResolver,
    loop_slots: L,
    mkfs: M,
}

impl RootDiskDriver {
    pub fn new(config: SharedConfigSource) -> Self {
        let paths = SystemPaths::default();
        let loop_slots =
            KernelLoopSlots::new(paths.loop_prefix.clone(), paths.sys_class_block.clone());
        Self::with_parts(config, paths, loop_slots, SystemMakeFs)
    }
}

impl<L, M> RootDiskDriver<L, M>
where
    L: LoopSlots + Send + Sync,
    M: MakeFs,
{
    pub fn with_parts(config: SharedConfigSource, paths: SystemPaths, loop_slots: L, mkfs: M) -> Self {
        let resolver =
            RootDeviceResolver::new(paths.dev_dir.clone(), paths.root_mount_points.clone());
        Self {
            config,
            paths,
            resolver,
            loop_slots,
            mkfs,
        }
    }

    pub fn with_resolver(mut self, resolver: RootDeviceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Inventory of the disk holding the root filesystem.
    pub async fn root_disk(&self) -> Result<DiskInfo> {
        let root_device = self
            .resolver
            .resolve()
            .await
            .context("Cannot find the block device of the root filesystem")?;
        disk::build(&self.paths, &root_device).await
    }

    async fn try_find(&self, name: &str) -> Result<Option<RootDiskVolume>> {
        let overlay_label = self.config.get_overlay_label().await?;
        if name != overlay_label {
            tracing::debug!(name, %overlay_label, "Not the overlay volume, skip");
            return Ok(None);
        }

        let Some(root_device) = self.resolver.resolve().await else {
            tracing::debug!("No usable root block device");
            return Ok(None);
        };

        let header = SquashfsHeader::read_from(&root_device).await?;
        let boot_params = self.config.get_boot_params().await?;
        let disk = disk::build(&self.paths, &root_device).await?;
        let partition_labels = read_partition_labels(&disk).await;

        let placement = planner::plan(&PlacementRequest {
            root_device: &root_device,
            disk: &disk,
            bytes_used: header.bytes_used,
            selected_partition: boot_params.ovl_partition,
            overlay_label: &overlay_label,
            partition_labels: &partition_labels,
        });

        let overlay_partition = match &placement.target {
            OverlayTarget::Device { device } => disk
                .partitions
                .iter()
                .find(|part| &part.dev == device)
                .map(|part| part.number),
            OverlayTarget::Region { .. } => None,
        };
        disk.log_partition_table(overlay_partition);

        tracing::debug!(
            device = ?placement.target.device(),
            offset = placement.target.offset(),
            creation_forbidden = placement.creation_forbidden,
            "Overlay placement decided"
        );

        Ok(Some(RootDiskVolume::new(name, root_device, placement)))
    }

    fn bind(&self, volume: &mut RootDiskVolume) -> Result<()> {
        match &volume.target {
            OverlayTarget::Device { device } => {
                volume.device_name = Some(device.clone());
            }
            OverlayTarget::Region {
                backing,
                offset,
                size_limit,
            } => {
                let request = LoopRequest {
                    backing: backing.clone(),
                    offset: *offset,
                    size_limit: *size_limit,
                };
                match loop_dev::bind(&self.loop_slots, &request) {
                    Ok(loop_device) => {
                        volume.device_name = Some(loop_device);
                        volume.byte_offset = 0;
                    }
                    Err(error) => {
                        volume.device_name = None;
                        tracing::error!("unable to create loop device");
                        return Err(error);
                    }
                }
            }
        }

        volume.state = VolumeState::Bound;
        Ok(())
    }

    async fn choose_fs_type(&self, target: &OverlayTarget) -> Result<MakeFsType> {
        let f2fs_enabled = self
            .config
            .get_global_config()
            .await?
            .is_some_and(|global| global.f2fs_enabled());
        if !f2fs_enabled {
            return Ok(MakeFsType::Ext4);
        }

        let fs_type = match region_size(target).await {
            Ok(size) if size > F2FS_MIN_SIZE => MakeFsType::F2fs,
            Ok(size) => {
                tracing::debug!(size, "Overlay region too small for f2fs");
                MakeFsType::Ext4
            }
            Err(error) => {
                tracing::debug!(?error, "Cannot get overlay region size, fallback to ext4");
                MakeFsType::Ext4
            }
        };
        Ok(fs_type)
    }
}

async fn read_partition_labels(disk: &DiskInfo) -> PartitionLabels {
    let mut labels = PartitionLabels::default();
    for part in disk.partitions.iter() {
        let label = match probe::read_label(&part.dev, 0).await {
            Ok(label) => label,
            Err(error) => {
                tracing::debug!(dev = ?part.dev, ?error, "Cannot read filesystem label");
                None
            }
        };
        if let Some(slot) = usize::from(part.number)
            .checked_sub(1)
            .and_then(|index| labels.get_mut(index))
        {
            *slot = label;
        }
    }
    labels
}

/// Bytes available to the overlay at `target`.
async fn region_size(target: &OverlayTarget) -> Result<u64> {
    if let OverlayTarget::Region {
        size_limit: Some(size_limit),
        ..
    } = target
    {
        return Ok(*size_limit);
    }

    let device = target.device();
    let device_size = File::open(device)
        .await
        .with_context(|| format!("Failed to open {device:?}"))?
        .into_std()
        .await
        .get_block_device_size()
        .with_context(|| format!("Failed to get size of block device {device:?}"))?;

    device_size
        .checked_sub(target.offset())
        .with_context(|| format!("Overlay offset {} is past the end of {device:?}", target.offset()))
}

#[async_trait]
impl<L, M> VolumeDriver for RootDiskDriver<L, M>
where
    L: LoopSlots + Send + Sync,
    M: MakeFs,
{
    type Volume = RootDiskVolume;

    fn name(&self) -> &'static str {
        ROOTDISK_DRIVER_NAME
    }

    async fn find(&self, name: &str) -> Option<RootDiskVolume> {
        match self.try_find(name).await {
            Ok(volume) => volume,
            Err(error) => {
                tracing::warn!("Cannot find overlay volume {name}: {error:#}");
                None
            }
        }
    }

    async fn init(&self, volume: &mut RootDiskVolume) -> Result<()> {
        if volume.creation_forbidden {
            bail!(
                "Overlay filesystem cannot be created on {:?}",
                volume.target.device()
            )
        }

        if volume.state < VolumeState::Bound {
            self.bind(volume)?;
        }

        let kind = self.identify(volume).await?;
        volume.state = VolumeState::Identified;
        if kind != FilesystemKind::None {
            tracing::debug!(%kind, "Overlay filesystem already present");
            volume.state = VolumeState::Ready;
            return Ok(());
        }

        let device = volume
            .device_name
            .clone()
            .context("Overlay volume has no block device")?;
        tracing::info!("rootdisk overlay filesystem has not been formatted yet");

        let fs_type = self.choose_fs_type(&volume.target).await?;
        tracing::info!(
            "creating {fs_type} overlay filesystem ({}, offset {})...",
            device.display(),
            volume.target.offset()
        );
        if let Err(error) = self.mkfs.mkfs(&device, fs_type, &volume.name).await {
            tracing::error!("overlay filesystem creation failed: {error:#}");
            return Err(error);
        }

        volume.state = VolumeState::Formatted;
        Ok(())
    }

    async fn identify(&self, volume: &RootDiskVolume) -> Result<FilesystemKind> {
        let Some(device) = &volume.device_name else {
            bail!("Overlay volume {} has no block device", volume.name)
        };
        probe::identify(device, volume.byte_offset).await
    }
}
