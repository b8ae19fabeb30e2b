pub mod block;
pub mod cmd;
pub mod magic;
pub mod mkfs;
pub mod probe;
pub mod sysfs;

use std::path::PathBuf;

/// Filesystem locations the driver reads from. Tests point these at
/// fabricated trees.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    /// Directory holding the device nodes.
    pub dev_dir: PathBuf,
    /// Sysfs directory with one entry per block device.
    pub sys_class_block: PathBuf,
    /// Loop device nodes are this prefix followed by their index.
    pub loop_prefix: PathBuf,
    /// Mount points tried, in order, to find the root block device.
    pub root_mount_points: Vec<PathBuf>,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_class_block: PathBuf::from("/sys/class/block"),
            loop_prefix: PathBuf::from("/dev/loop"),
            root_mount_points: vec![PathBuf::from("/"), PathBuf::from("/rom")],
        }
    }
}
