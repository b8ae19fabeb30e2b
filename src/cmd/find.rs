use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::FindOptions, driver::rootdisk::RootDiskVolume};

pub struct FindCommand {
    pub find_options: FindOptions,
}

#[async_trait]
impl super::Command for FindCommand {
    async fn run(&self) -> Result<()> {
        let driver = super::rootdisk_driver().await?;
        let volume = super::find_volume(&driver, self.find_options.name.as_deref()).await?;

        if self.find_options.json {
            println!("{}", serde_json::to_string_pretty(&volume)?);
        } else {
            print!("{}", describe_volume(&volume));
        }

        Ok(())
    }
}

fn describe_volume(volume: &RootDiskVolume) -> String {
    format!(
        "name: {}\nroot device: {}\ndevice: {}\noffset: {}\ncreation forbidden: {}\n",
        volume.name,
        volume.root_device.display(),
        volume
            .device_name
            .as_ref()
            .map(|device| device.display().to_string())
            .unwrap_or_else(|| "<none>".into()),
        volume.byte_offset,
        volume.creation_forbidden,
    )
}
