use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::IdentifyOptions, driver::VolumeDriver as _};

pub struct IdentifyCommand {
    pub identify_options: IdentifyOptions,
}

#[async_trait]
impl super::Command for IdentifyCommand {
    async fn run(&self) -> Result<()> {
        let driver = super::rootdisk_driver().await?;
        let volume = super::find_volume(&driver, self.identify_options.name.as_deref()).await?;

        let kind = driver.identify(&volume).await?;
        println!("{kind}");

        Ok(())
    }
}
