use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{cli::InitOptions, driver::VolumeDriver as _};

pub struct InitCommand {
    pub init_options: InitOptions,
}

#[async_trait]
impl super::Command for InitCommand {
    async fn run(&self) -> Result<()> {
        let driver = super::rootdisk_driver().await?;
        let mut volume = super::find_volume(&driver, self.init_options.name.as_deref()).await?;

        driver
            .init(&mut volume)
            .await
            .with_context(|| format!("Failed to initialize overlay volume `{}`", volume.name))?;

        tracing::info!(state = %volume.state, "Overlay volume is ready");
        if let Some(device) = &volume.device_name {
            println!("{}", device.display());
        }

        Ok(())
    }
}
