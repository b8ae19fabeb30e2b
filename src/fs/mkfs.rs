use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{fs::cmd::CheckCommandOutput as _, types::MakeFsType};

#[async_trait]
pub trait MakeFs: Send + Sync {
    /// Create a `fs_type` filesystem labelled `label` on `device`.
    async fn mkfs(&self, device: &Path, fs_type: MakeFsType, label: &str) -> Result<()>;
}

/// Formats through the `mkfs.*` tools found in `PATH`.
pub struct SystemMakeFs;

impl SystemMakeFs {
    fn command(device: &Path, fs_type: MakeFsType, label: &str) -> Command {
        let mut cmd = match fs_type {
            MakeFsType::Ext4 => {
                let mut cmd = Command::new("mkfs.ext4");
                cmd.args(["-q", "-L", label]);
                cmd
            }
            MakeFsType::F2fs => {
                let mut cmd = Command::new("mkfs.f2fs");
                cmd.args(["-q", "-l", label]);
                cmd
            }
        };
        cmd.arg(device);
        cmd
    }
}

#[async_trait]
impl MakeFs for SystemMakeFs {
    async fn mkfs(&self, device: &Path, fs_type: MakeFsType, label: &str) -> Result<()> {
        Self::command(device, fs_type, label)
            .run()
            .await
            .with_context(|| format!("Failed to create {fs_type} filesystem on {device:?}"))?;
        Ok(())
    }
}
