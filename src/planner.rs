//! Decides where the overlay filesystem lives. Pure: every input is read by
//! the caller beforehand, so the policy can be exercised without devices.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::disk::{DiskInfo, MAX_PARTITIONS};

/// Overlay regions start on a 64 KiB boundary.
pub const OVERLAY_ALIGN: u64 = 64 * 1024;
/// Smallest region an overlay filesystem is created in.
pub const OVERLAY_MIN_SIZE: u64 = 1024 * 1024;

/// Round `value` up to a multiple of `align`, saturating on overflow.
pub fn align_up(value: u64, align: u64) -> u64 {
    value.checked_next_multiple_of(align).unwrap_or(u64::MAX)
}

/// Whether a minimum sized overlay starting at `offset` ends within `limit`.
fn fits(offset: u64, limit: u64) -> bool {
    offset
        .checked_add(OVERLAY_MIN_SIZE)
        .is_some_and(|end| end <= limit)
}

/// Labels of the filesystems found on each partition slot, `None` where no
/// ext4 or f2fs filesystem was found.
pub type PartitionLabels = [Option<Vec<u8>>; MAX_PARTITIONS];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OverlayTarget {
    /// A block device used from its first byte, usually a partition.
    Device { device: PathBuf },
    /// A byte range of a larger device, to be exposed through a loop device.
    Region {
        backing: PathBuf,
        offset: u64,
        /// Length of the range. `None` runs to the end of `backing`.
        size_limit: Option<u64>,
    },
}

impl OverlayTarget {
    /// The device named in diagnostics: the partition or the backing device.
    pub fn device(&self) -> &Path {
        match self {
            OverlayTarget::Device { device } => device,
            OverlayTarget::Region { backing, .. } => backing,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            OverlayTarget::Device { .. } => 0,
            OverlayTarget::Region { offset, .. } => *offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub target: OverlayTarget,
    /// The overlay must not be formatted at `target`.
    pub creation_forbidden: bool,
}

impl Placement {
    fn allowed(target: OverlayTarget) -> Self {
        Self {
            target,
            creation_forbidden: false,
        }
    }

    fn forbidden(target: OverlayTarget) -> Self {
        Self {
            target,
            creation_forbidden: true,
        }
    }
}

pub struct PlacementRequest<'a> {
    pub root_device: &'a Path,
    pub disk: &'a DiskInfo,
    /// Length of the squashfs root image.
    pub bytes_used: u64,
    /// Partition picked with `ovl-partition=N` on the kernel command line.
    pub selected_partition: Option<u8>,
    pub overlay_label: &'a str,
    pub partition_labels: &'a PartitionLabels,
}

pub fn plan(req: &PlacementRequest<'_>) -> Placement {
    let disk = req.disk;

    if !disk.partitioned() {
        tracing::info!("root filesystem on the {} device", req.root_device.display());
        return plan_after_image(req.root_device, req.bytes_used, disk.size);
    }

    tracing::info!(
        "root filesystem on the {} partition of {} ({}) device",
        req.root_device.display(),
        disk.dev.display(),
        if disk.ro { "ro" } else { "rw" }
    );

    if disk.ro {
        tracing::warn!("root device {} is in read-only mode", disk.dev.display());
        return Placement::forbidden(OverlayTarget::Device {
            device: disk.dev.clone(),
        });
    }

    let selected = req.selected_partition.and_then(|number| {
        let part = disk.partitions.get(number);
        if part.is_none() {
            tracing::warn!("ovl-partition {number} does not exist, fallback to default behavior");
        }
        part
    });

    if let Some(part) = selected.filter(|part| !part.rootfs) {
        return Placement::allowed(OverlayTarget::Device {
            device: part.dev.clone(),
        });
    }

    if let Some(part) = find_labeled_partition(req) {
        tracing::info!("found suitable overlay partition {}", part.display());
        return Placement::allowed(OverlayTarget::Device {
            device: part.to_owned(),
        });
    }

    if let Some(rootfs) = disk.rootfs().filter(|rootfs| !rootfs.ro) {
        let offset = align_up(req.bytes_used, OVERLAY_ALIGN);
        if fits(offset, rootfs.size) {
            // Unused space trailing the image inside the rootfs partition.
            return Placement::allowed(OverlayTarget::Region {
                backing: disk.dev.clone(),
                offset: rootfs.start + offset,
                size_limit: Some(rootfs.size - offset),
            });
        }
    }

    if let Some(part) = selected {
        tracing::warn!(
            "no space on {} partition for overlay filesystem",
            part.dev.display()
        );
        return Placement::forbidden(OverlayTarget::Device {
            device: part.dev.clone(),
        });
    }

    let end = disk.partitions.last().map(|part| part.end()).unwrap_or(0);
    plan_after_image(&disk.dev, end, disk.size)
}

/// Overlay on `dev` right after `used` bytes, if a minimum sized overlay fits
/// before `size`.
fn plan_after_image(dev: &Path, used: u64, size: u64) -> Placement {
    let target = OverlayTarget::Region {
        backing: dev.to_owned(),
        offset: align_up(used, OVERLAY_ALIGN),
        size_limit: None,
    };

    if fits(target.offset(), size) {
        Placement::allowed(target)
    } else {
        tracing::warn!("no space on {} device for overlay filesystem", dev.display());
        Placement::forbidden(target)
    }
}

fn find_labeled_partition<'a>(req: &'a PlacementRequest<'_>) -> Option<&'a Path> {
    req.disk
        .partitions
        .iter()
        .find(|part| {
            usize::from(part.number)
                .checked_sub(1)
                .and_then(|index| req.partition_labels.get(index))
                .and_then(Option::as_ref)
                .is_some_and(|label| label.as_slice() == req.overlay_label.as_bytes())
        })
        .map(|part| part.dev.as_path())
}
