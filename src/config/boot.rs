//! Values handed over by the boot environment: the overlay label written by
//! early userspace and the partition selection on the kernel command line.

use serde::Serialize;

use crate::{disk::MAX_PARTITIONS, fs::sysfs::parse_c_integer};

pub const DEFAULT_OVERLAY_LABEL: &str = "rootfs_data";

/// Longest label taken from the label file.
const OVERLAY_LABEL_MAX_LEN: usize = 63;

const OVL_PARTITION_KEYS: [&str; 2] = ["ovl-partition", "ovl_partition"];

/// Overlay label from the raw content of the label file. Missing or blank
/// content selects [`DEFAULT_OVERLAY_LABEL`].
pub fn parse_overlay_label(raw: Option<&[u8]>) -> String {
    let label = raw
        .map(|raw| &raw[..raw.len().min(OVERLAY_LABEL_MAX_LEN)])
        .map(|raw| {
            let end = raw
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |last| last + 1);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        })
        .unwrap_or_default();

    if label.is_empty() {
        DEFAULT_OVERLAY_LABEL.to_owned()
    } else {
        label
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BootParams {
    /// Partition the operator picked for the overlay.
    pub ovl_partition: Option<u8>,
}

impl BootParams {
    pub fn from_cmdline(cmdline: &str) -> Self {
        let value = OVL_PARTITION_KEYS.iter().find_map(|key| {
            cmdline
                .split_whitespace()
                .find_map(|arg| arg.strip_prefix(key)?.strip_prefix('='))
        });
        let Some(value) = value else {
            return Self::default();
        };

        let ovl_partition = parse_c_integer(value)
            .and_then(|number| u8::try_from(number).ok())
            .filter(|number| (1..=MAX_PARTITIONS as u8).contains(number));
        match ovl_partition {
            Some(number) => {
                tracing::info!("try to use ovl-partition {number} for overlay filesystem")
            }
            None => tracing::error!(
                value,
                "wrong 'ovl-partition' value (should be in the range from 1 to {MAX_PARTITIONS})"
            ),
        }

        Self { ovl_partition }
    }
}

#[cfg(test)]
pub mod tests {

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, "rootfs_data")]
    #[case(Some(&b""[..]), "rootfs_data")]
    #[case(Some(&b" \n\t"[..]), "rootfs_data")]
    #[case(Some(&b"overlay\n"[..]), "overlay")]
    #[case(Some(&b"my data  \r\n"[..]), "my data")]
    #[case(Some("data\u{3000}\n".as_bytes()), "data\u{3000}")]
    #[case(Some("\u{e9}t\u{e9} \n".as_bytes()), "\u{e9}t\u{e9}")]
    fn test_parse_overlay_label(#[case] raw: Option<&[u8]>, #[case] expected: &str) {
        assert_eq!(parse_overlay_label(raw), expected);
    }

    #[test]
    fn test_parse_overlay_label_truncates() {
        let raw = "x".repeat(100);
        assert_eq!(parse_overlay_label(Some(raw.as_bytes())), "x".repeat(63));
    }

    #[rstest]
    #[case("", None)]
    #[case("console=ttyS0 root=/dev/sda2", None)]
    #[case("root=/dev/sda2 ovl-partition=3 quiet", Some(3))]
    #[case("ovl_partition=2", Some(2))]
    #[case("ovl-partition=0x4", Some(4))]
    #[case("ovl-partition=0", None)]
    #[case("ovl-partition=5", None)]
    #[case("ovl-partition=-1", None)]
    #[case("ovl-partition=abc", None)]
    #[case("ovl-partition=256", None)]
    #[case("ovl_partition=1 ovl-partition=3", Some(3))]
    #[case("noovl-partition=2", None)]
    fn test_boot_params_from_cmdline(#[case] cmdline: &str, #[case] expected: Option<u8>) {
        assert_eq!(BootParams::from_cmdline(cmdline).ovl_partition, expected);
    }
}
