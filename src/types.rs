use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// Filesystem kinds known to the overlay volume drivers. The rootdisk driver
/// only ever reports `None`, `F2fs` or `Ext4`, the other kinds belong to the
/// flash backed drivers and are kept so the numbering stays stable.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    None,
    Snapshot,
    Jffs2,
    Deadcode,
    Ubifs,
    F2fs,
    Ext4,
}

impl Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}

/// The filesystem created on a fresh overlay volume.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum MakeFsType {
    Ext4,
    F2fs,
}

impl Display for MakeFsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}
