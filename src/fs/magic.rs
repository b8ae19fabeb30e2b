//! On-disk signatures and a tiny positional reader for them.
//!
//! All the offsets below are relative to the start of the filesystem, which
//! may itself sit at an arbitrary byte offset of the device being probed.

use std::{io::SeekFrom, path::Path};

use anyhow::{Context as _, Result};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt as _, AsyncSeek, AsyncSeekExt as _},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// An unsigned integer field of a superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u64,
    pub width: usize,
    pub endian: Endian,
}

impl Field {
    pub const fn le32(offset: u64) -> Self {
        Self {
            offset,
            width: 4,
            endian: Endian::Little,
        }
    }

    pub const fn le64(offset: u64) -> Self {
        Self {
            offset,
            width: 8,
            endian: Endian::Little,
        }
    }

    /// Decode the field from `bytes`, which must hold at least `width` bytes.
    pub fn decode(&self, bytes: &[u8]) -> u64 {
        let bytes = &bytes[..self.width];
        match self.endian {
            Endian::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            Endian::Big => bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        }
    }
}

/// A NUL padded string field of a superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelField {
    pub offset: u64,
    pub len: usize,
}

impl LabelField {
    /// Cut the raw field at the first NUL byte.
    pub fn decode(&self, bytes: &[u8]) -> Vec<u8> {
        let bytes = &bytes[..self.len.min(bytes.len())];
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        bytes[..end].to_vec()
    }
}

pub const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
/// magic (4) + nine reserved words (36) + bytes_used (8)
pub const SQUASHFS_HEADER_LEN: usize = 48;
pub const SQUASHFS_BYTES_USED: Field = Field::le64(0x28);

pub const F2FS_MAGIC: Field = Field::le32(0x400);
pub const F2FS_MAGIC_VALUE: u64 = 0xF2F5_2010;
pub const F2FS_LABEL: LabelField = LabelField {
    offset: 0x47c,
    len: 127,
};

pub const EXT4_MAGIC: Field = Field::le32(0x438);
pub const EXT4_MAGIC_MASK: u64 = 0xffff;
pub const EXT4_MAGIC_VALUE: u64 = 0xef53;
pub const EXT4_LABEL: LabelField = LabelField {
    offset: 0x478,
    len: 16,
};

/// Reads fields at absolute positions of a device or image file.
pub struct BinaryReader<R> {
    inner: R,
    name: String,
}

impl BinaryReader<File> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {path:?} for reading"))?;
        Ok(Self::new(file, format!("{path:?}")))
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> BinaryReader<R> {
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    /// Read exactly `len` bytes at `base + offset`. A short read is an error.
    pub async fn read_bytes(&mut self, base: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let pos = base
            .checked_add(offset)
            .with_context(|| format!("Offset {base} + {offset} overflows"))?;
        let mut buf = vec![0u8; len];
        async {
            self.inner.seek(SeekFrom::Start(pos)).await?;
            self.inner.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(())
        }
        .await
        .with_context(|| format!("Failed to read {len} bytes at {pos:#x} of {}", self.name))?;
        Ok(buf)
    }

    pub async fn read_field(&mut self, base: u64, field: &Field) -> Result<u64> {
        let bytes = self.read_bytes(base, field.offset, field.width).await?;
        Ok(field.decode(&bytes))
    }

    pub async fn read_label(&mut self, base: u64, field: &LabelField) -> Result<Vec<u8>> {
        let bytes = self.read_bytes(base, field.offset, field.len).await?;
        Ok(field.decode(&bytes))
    }
}
