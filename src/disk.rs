//! Inventory of the disk holding the root filesystem, built from sysfs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use glob::Pattern;
use serde::Serialize;

use crate::fs::{sysfs, SystemPaths};

/// Only the four primary partition slots are considered.
pub const MAX_PARTITIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub dev: PathBuf,
    /// Partition number, 1 to [`MAX_PARTITIONS`].
    pub number: u8,
    /// Start offset on the disk, in bytes.
    pub start: u64,
    /// Size in bytes.
    pub size: u64,
    pub ro: bool,
    pub rootfs: bool,
}

impl PartitionInfo {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// The partition slots of a disk, addressed by partition number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionTable([Option<PartitionInfo>; MAX_PARTITIONS]);

impl PartitionTable {
    pub fn get(&self, number: u8) -> Option<&PartitionInfo> {
        let index = usize::from(number).checked_sub(1)?;
        self.0.get(index)?.as_ref()
    }

    /// Put `partition` in its slot. Numbers outside 1 to 4 are ignored.
    pub fn insert(&mut self, partition: PartitionInfo) {
        let Some(index) = usize::from(partition.number).checked_sub(1) else {
            return;
        };
        if let Some(slot) = self.0.get_mut(index) {
            *slot = Some(partition);
        }
    }

    /// Present partitions, in partition number order.
    pub fn iter(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.0.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The present partition with the highest number.
    pub fn last(&self) -> Option<&PartitionInfo> {
        self.iter().last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    /// Whole disk device, e.g. `/dev/sda`.
    pub dev: PathBuf,
    /// Device name without the directory, e.g. `sda`.
    pub devname: String,
    pub sector_size: u64,
    /// Disk size in bytes.
    pub size: u64,
    pub ro: bool,
    pub partitions: PartitionTable,
    /// Number of the partition holding the root filesystem, if any.
    pub rootfs_partition: Option<u8>,
}

impl DiskInfo {
    pub fn partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn rootfs(&self) -> Option<&PartitionInfo> {
        self.partitions.get(self.rootfs_partition?)
    }

    pub fn log_partition_table(&self, overlay_partition: Option<u8>) {
        for part in self.partitions.iter() {
            tracing::info!(
                "{}: p{}, {}, start {}, size {}{}{}",
                part.dev.display(),
                part.number,
                if part.ro { "ro" } else { "rw" },
                part.start,
                part.size,
                if part.rootfs { " [rootfs]" } else { "" },
                if overlay_partition == Some(part.number) {
                    " [overlayfs]"
                } else {
                    ""
                },
            );
        }
    }
}

fn devname_of(dev: &Path) -> Result<String> {
    dev.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("No device name in {dev:?}"))
}

/// The whole disk `devname` is a partition of, taken from the sysfs link
/// `../../devices/.../block/<disk>/<devname>`. `None` for whole disks.
pub fn disk_name_from_link(link: &Path, devname: &str) -> Option<String> {
    let components = link
        .iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>();
    let block = components.iter().rposition(|c| c == "block")?;
    let disk = components.get(block + 1)?;

    if disk == devname || !components[block + 2..].iter().any(|c| c == devname) {
        return None;
    }

    Some(disk.to_string())
}

async fn parent_disk_name(sys_class_block: &Path, devname: &str) -> Option<String> {
    let link_path = sys_class_block.join(devname);
    match tokio::fs::read_link(&link_path).await {
        Ok(link) => disk_name_from_link(&link, devname),
        Err(error) => {
            tracing::debug!(?link_path, ?error, "Cannot read sysfs link, assuming a whole disk");
            None
        }
    }
}

/// Describe the disk holding `root_device` and its partitions.
pub async fn build(paths: &SystemPaths, root_device: &Path) -> Result<DiskInfo> {
    let root_devname = devname_of(root_device)?;
    let sys = &paths.sys_class_block;

    let (dev, devname) = match parent_disk_name(sys, &root_devname).await {
        Some(disk) => {
            if sysfs::read_u64(sys.join(&disk).join("partition")).await.is_ok() {
                bail!("Parent device {disk} of {root_device:?} is itself a partition")
            }
            (paths.dev_dir.join(&disk), disk)
        }
        None => (root_device.to_owned(), root_devname),
    };

    let sector_size = sysfs::read_u64(sys.join(&devname).join("queue/hw_sector_size"))
        .await
        .context("Failed to get sector size of root disk")?;
    let size = sysfs::read_u64(sys.join(&devname).join("size"))
        .await
        .context("Failed to get size of root disk")?
        .saturating_mul(sector_size);
    let ro = sysfs::read_u64(sys.join(&devname).join("ro"))
        .await
        .map(|ro| ro != 0)
        .unwrap_or(false);

    let mut disk = DiskInfo {
        dev,
        devname,
        sector_size,
        size,
        ro,
        partitions: PartitionTable::default(),
        rootfs_partition: None,
    };
    scan_partitions(paths, root_device, &mut disk).await?;

    Ok(disk)
}

async fn scan_partitions(
    paths: &SystemPaths,
    root_device: &Path,
    disk: &mut DiskInfo,
) -> Result<()> {
    let pattern = Pattern::new(&format!("{}*", Pattern::escape(&disk.devname)))
        .context("Bad partition name pattern")?;

    let mut names = vec![];
    let mut entries = tokio::fs::read_dir(&paths.dev_dir)
        .await
        .with_context(|| format!("Failed to list {:?}", paths.dev_dir))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.matches(&name) {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        let attr = paths.sys_class_block.join(&name);

        // `sda*` also matches `sdaa1`, which belongs to another disk.
        if parent_disk_name(&paths.sys_class_block, &name).await.as_deref()
            != Some(disk.devname.as_str())
        {
            continue;
        }

        // Entries without a partition number are not partitions.
        let Ok(number) = sysfs::read_u64(attr.join("partition")).await else {
            continue;
        };
        let number = match u8::try_from(number) {
            Ok(number @ 1..=4) => number,
            _ => {
                tracing::debug!(%name, number, "Ignoring partition outside the primary slots");
                continue;
            }
        };

        let dev = paths.dev_dir.join(&name);
        let attributes = async {
            let start = sysfs::read_u64(attr.join("start")).await?;
            let size = sysfs::read_u64(attr.join("size")).await?;
            let ro = sysfs::read_u64(attr.join("ro")).await? != 0;
            Ok::<_, anyhow::Error>((start, size, ro))
        }
        .await;
        let (start, size, ro) = match attributes {
            Ok(attributes) => attributes,
            Err(error) => {
                tracing::warn!(?dev, ?error, "Skipping partition with unreadable attributes");
                continue;
            }
        };

        let rootfs = dev == root_device;
        if rootfs {
            disk.rootfs_partition = Some(number);
        }

        disk.partitions.insert(PartitionInfo {
            dev,
            number,
            start: start.saturating_mul(disk.sector_size),
            size: size.saturating_mul(disk.sector_size),
            ro,
            rootfs,
        });
    }

    Ok(())
}

#[cfg(test)]
pub mod tests {

    use std::os::unix::fs::symlink;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    /// A fabricated `/dev` + `/sys` pair.
    pub struct FakeSystem {
        pub root: TempDir,
        pub paths: SystemPaths,
    }

    impl FakeSystem {
        pub fn new() -> Result<Self> {
            let root = tempfile::tempdir()?;
            let paths = SystemPaths {
                dev_dir: root.path().join("dev"),
                sys_class_block: root.path().join("sys/class/block"),
                loop_prefix: root.path().join("dev/loop"),
                root_mount_points: vec![],
            };
            std::fs::create_dir_all(&paths.dev_dir)?;
            std::fs::create_dir_all(&paths.sys_class_block)?;
            Ok(Self { root, paths })
        }

        fn write_attrs(dir: &Path, attrs: &[(&str, u64)]) -> Result<()> {
            for (name, value) in attrs {
                let path = dir.join(name);
                std::fs::create_dir_all(path.parent().context("no parent")?)?;
                std::fs::write(path, format!("{value}\n"))?;
            }
            Ok(())
        }

        /// Add a whole disk of `sectors` 512 byte sectors.
        pub fn add_disk(&self, name: &str, sectors: u64, ro: bool) -> Result<PathBuf> {
            let dir = self.root.path().join("sys/devices/virtual/block").join(name);
            Self::write_attrs(
                &dir,
                &[
                    ("queue/hw_sector_size", 512),
                    ("size", sectors),
                    ("ro", ro as u64),
                ],
            )?;
            symlink(
                format!("../../devices/virtual/block/{name}"),
                self.paths.sys_class_block.join(name),
            )?;
            let dev = self.paths.dev_dir.join(name);
            std::fs::write(&dev, b"")?;
            Ok(dev)
        }

        pub fn add_partition(
            &self,
            disk: &str,
            name: &str,
            number: u64,
            start: u64,
            sectors: u64,
            ro: bool,
        ) -> Result<PathBuf> {
            let dir = self
                .root
                .path()
                .join("sys/devices/virtual/block")
                .join(disk)
                .join(name);
            Self::write_attrs(
                &dir,
                &[
                    ("partition", number),
                    ("start", start),
                    ("size", sectors),
                    ("ro", ro as u64),
                ],
            )?;
            symlink(
                format!("../../devices/virtual/block/{disk}/{name}"),
                self.paths.sys_class_block.join(name),
            )?;
            let dev = self.paths.dev_dir.join(name);
            std::fs::write(&dev, b"")?;
            Ok(dev)
        }
    }

    #[rstest]
    #[case("../../devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda/sda2", "sda2", Some("sda"))]
    #[case("../../devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda", "sda", None)]
    #[case("../../devices/platform/soc/mmc0/mmc0:0001/block/mmcblk0/mmcblk0p2", "mmcblk0p2", Some("mmcblk0"))]
    #[case("../../devices/virtual/block/loop0", "loop0", None)]
    #[case("../../devices/virtual/misc/foo", "foo", None)]
    fn test_disk_name_from_link(
        #[case] link: &str,
        #[case] devname: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(
            disk_name_from_link(Path::new(link), devname).as_deref(),
            expected
        );
    }

    #[tokio::test]
    async fn test_build_whole_disk() -> Result<()> {
        let system = FakeSystem::new()?;
        let root = system.add_disk("vda", 131072, false)?;

        let disk = build(&system.paths, &root).await?;

        assert_eq!(disk.dev, root);
        assert_eq!(disk.devname, "vda");
        assert_eq!(disk.size, 64 * 1024 * 1024);
        assert!(!disk.ro);
        assert!(!disk.partitioned());
        assert_eq!(disk.rootfs_partition, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_partitioned() -> Result<()> {
        let system = FakeSystem::new()?;
        let disk_dev = system.add_disk("sda", 1 << 21, false)?;
        system.add_partition("sda", "sda1", 1, 2048, 32768, false)?;
        let root = system.add_partition("sda", "sda2", 2, 34816, 65536, true)?;
        system.add_partition("sda", "sda4", 4, 100352, 8192, false)?;
        // Same prefix, but not a partition.
        std::fs::write(system.paths.dev_dir.join("sdaux"), b"")?;

        let disk = build(&system.paths, &root).await?;

        assert_eq!(disk.dev, disk_dev);
        assert!(disk.partitioned());
        assert_eq!(disk.rootfs_partition, Some(2));
        assert_eq!(
            disk.partitions.iter().map(|p| p.number).collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert!(disk.partitions.get(3).is_none());

        let rootfs = disk.rootfs().context("no rootfs partition")?;
        assert_eq!(rootfs.dev, root);
        assert_eq!(rootfs.start, 34816 * 512);
        assert_eq!(rootfs.size, 65536 * 512);
        assert!(rootfs.ro);
        assert!(rootfs.rootfs);
        assert!(!disk.partitions.get(1).context("no p1")?.rootfs);
        assert_eq!(disk.partitions.last().map(|p| p.number), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn test_build_skips_partial_and_out_of_range() -> Result<()> {
        let system = FakeSystem::new()?;
        system.add_disk("sdb", 1 << 20, false)?;
        let root = system.add_partition("sdb", "sdb1", 1, 2048, 4096, false)?;
        let broken = system.add_partition("sdb", "sdb2", 2, 8192, 4096, false)?;
        system.add_partition("sdb", "sdb5", 5, 16384, 4096, false)?;
        std::fs::remove_file(
            system
                .root
                .path()
                .join("sys/devices/virtual/block/sdb/sdb2/size"),
        )?;

        let disk = build(&system.paths, &root).await?;

        assert!(disk.partitions.get(1).is_some());
        assert!(disk.partitions.get(2).is_none(), "{broken:?} has no size");
        assert_eq!(disk.partitions.iter().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_skips_partition_without_ro() -> Result<()> {
        let system = FakeSystem::new()?;
        system.add_disk("sdd", 1 << 20, false)?;
        let root = system.add_partition("sdd", "sdd1", 1, 2048, 4096, false)?;
        system.add_partition("sdd", "sdd2", 2, 8192, 4096, false)?;
        std::fs::remove_file(
            system
                .root
                .path()
                .join("sys/devices/virtual/block/sdd/sdd2/ro"),
        )?;

        let disk = build(&system.paths, &root).await?;

        assert!(disk.partitions.get(1).is_some());
        assert!(disk.partitions.get(2).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_build_ignores_partitions_of_other_disks() -> Result<()> {
        let system = FakeSystem::new()?;
        system.add_disk("sda", 1 << 21, false)?;
        let sda1 = system.add_partition("sda", "sda1", 1, 2048, 32768, false)?;
        let root = system.add_partition("sda", "sda2", 2, 34816, 65536, true)?;
        system.add_disk("sdaa", 1 << 21, false)?;
        system.add_partition("sdaa", "sdaa1", 1, 2048, 8192, false)?;
        system.add_partition("sdaa", "sdaa3", 3, 16384, 8192, false)?;

        let disk = build(&system.paths, &root).await?;

        assert_eq!(disk.partitions.get(1).map(|p| &p.dev), Some(&sda1));
        assert!(disk.partitions.get(3).is_none());
        assert_eq!(
            disk.partitions.iter().map(|p| p.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_build_missing_disk_attributes() -> Result<()> {
        let system = FakeSystem::new()?;
        let root = system.add_disk("vdb", 4096, false)?;
        std::fs::remove_file(
            system
                .root
                .path()
                .join("sys/devices/virtual/block/vdb/queue/hw_sector_size"),
        )?;

        assert!(build(&system.paths, &root).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_build_missing_ro_means_rw() -> Result<()> {
        let system = FakeSystem::new()?;
        let root = system.add_disk("vdc", 4096, true)?;
        std::fs::remove_file(system.root.path().join("sys/devices/virtual/block/vdc/ro"))?;

        assert!(!build(&system.paths, &root).await?.ro);
        Ok(())
    }

    #[tokio::test]
    async fn test_build_rejects_partition_parent() -> Result<()> {
        let system = FakeSystem::new()?;
        system.add_disk("sdc", 1 << 20, false)?;
        system.add_partition("sdc", "sdc1", 1, 2048, 4096, false)?;
        // A "partition" of sdc1, as seen on stacked block devices.
        let root = system.add_partition("sdc1", "sdc1p1", 1, 0, 1024, false)?;

        assert!(build(&system.paths, &root).await.is_err());
        Ok(())
    }

    #[test]
    fn test_partition_table_slots() {
        let mut table = PartitionTable::default();
        let part = |number| PartitionInfo {
            dev: PathBuf::from(format!("/dev/sda{number}")),
            number,
            start: u64::from(number) * 1024,
            size: 1024,
            ro: false,
            rootfs: false,
        };
        table.insert(part(3));
        table.insert(part(0));
        table.insert(part(5));

        assert!(table.get(0).is_none());
        assert!(table.get(1).is_none());
        assert_eq!(table.get(3).map(|p| p.number), Some(3));
        assert!(table.get(5).is_none());
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.last().map(PartitionInfo::end), Some(4096));
    }
}
