use std::path::Path;

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncSeek};

use crate::types::FilesystemKind;

use super::magic::{
    BinaryReader, EXT4_LABEL, EXT4_MAGIC, EXT4_MAGIC_MASK, EXT4_MAGIC_VALUE, F2FS_LABEL,
    F2FS_MAGIC, F2FS_MAGIC_VALUE, SQUASHFS_BYTES_USED, SQUASHFS_HEADER_LEN, SQUASHFS_MAGIC,
};

/// Classify the filesystem starting at `offset` of `dev` by its magic numbers.
///
/// A target that cannot be opened is reported as [`FilesystemKind::None`],
/// while a target that is too short to hold the magic windows is an error.
pub async fn identify(dev: impl AsRef<Path>, offset: u64) -> Result<FilesystemKind> {
    let dev = dev.as_ref();
    let mut reader = match BinaryReader::open(dev).await {
        Ok(reader) => reader,
        Err(error) => {
            tracing::debug!(?error, ?dev, "Cannot open device for probing");
            return Ok(FilesystemKind::None);
        }
    };

    identify_with(&mut reader, offset)
        .await
        .with_context(|| format!("Failed to identify filesystem on {dev:?} at offset {offset}"))
}

pub async fn identify_with<R: AsyncRead + AsyncSeek + Unpin>(
    reader: &mut BinaryReader<R>,
    offset: u64,
) -> Result<FilesystemKind> {
    let mut kind = FilesystemKind::None;

    if reader.read_field(offset, &F2FS_MAGIC).await? == F2FS_MAGIC_VALUE {
        kind = FilesystemKind::F2fs;
    }

    // Checked last, so an ext4 signature wins when both are present.
    if reader.read_field(offset, &EXT4_MAGIC).await? & EXT4_MAGIC_MASK == EXT4_MAGIC_VALUE {
        kind = FilesystemKind::Ext4;
    }

    Ok(kind)
}

/// Read the volume label of the ext4 or f2fs filesystem at `offset` of `dev`.
///
/// Returns `None` for anything that is not ext4 or f2fs, whatever bytes are
/// stored where a label would be.
pub async fn read_label(dev: impl AsRef<Path>, offset: u64) -> Result<Option<Vec<u8>>> {
    let dev = dev.as_ref();
    let mut reader = BinaryReader::open(dev).await?;

    let label = match identify_with(&mut reader, offset).await? {
        FilesystemKind::Ext4 => Some(reader.read_label(offset, &EXT4_LABEL).await?),
        FilesystemKind::F2fs => Some(reader.read_label(offset, &F2FS_LABEL).await?),
        _ => None,
    };

    Ok(label)
}

/// The part of the squashfs superblock needed to place the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquashfsHeader {
    /// Exact length of the image in bytes.
    pub bytes_used: u64,
}

impl SquashfsHeader {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < SQUASHFS_HEADER_LEN {
            bail!("Squashfs header too short: {} bytes", raw.len())
        }
        if &raw[..SQUASHFS_MAGIC.len()] != SQUASHFS_MAGIC {
            bail!("Not a squashfs image: bad magic {:02x?}", &raw[..4])
        }

        let bytes_used = SQUASHFS_BYTES_USED.decode(&raw[SQUASHFS_BYTES_USED.offset as usize..]);
        Ok(Self { bytes_used })
    }

    pub async fn read_from(dev: impl AsRef<Path>) -> Result<Self> {
        let dev = dev.as_ref();
        let raw = BinaryReader::open(dev)
            .await?
            .read_bytes(0, 0, SQUASHFS_HEADER_LEN)
            .await?;
        Self::parse(&raw).with_context(|| format!("Failed to read squashfs header of {dev:?}"))
    }
}
