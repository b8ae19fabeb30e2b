use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

use crate::driver::{
    self,
    rootdisk::{RootDiskDriver, RootDiskVolume, ROOTDISK_DRIVER_NAME},
    Driver, VolumeDriver as _,
};

pub mod find;
pub mod identify;
pub mod init;
pub mod show;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Command {
    fn into_command(self) -> Box<dyn Command> {
        match self {
            crate::cli::Command::Find(find_options) => Box::new(find::FindCommand { find_options }),
            crate::cli::Command::Init(init_options) => Box::new(init::InitCommand { init_options }),
            crate::cli::Command::Identify(identify_options) => {
                Box::new(identify::IdentifyCommand { identify_options })
            }
            crate::cli::Command::Show(show_options) => Box::new(show::ShowCommand { show_options }),
        }
    }
}

async fn rootdisk_driver() -> Result<RootDiskDriver> {
    let config = crate::config::source::get_config_source().await;
    match driver::lookup(ROOTDISK_DRIVER_NAME, config) {
        Some(Driver::RootDisk(driver)) => Ok(driver),
        None => bail!("Volume driver `{ROOTDISK_DRIVER_NAME}` is not registered"),
    }
}

/// The volume name given on the command line, or the configured overlay label.
async fn volume_name(name: Option<&str>) -> Result<String> {
    match name {
        Some(name) => Ok(name.to_owned()),
        None => crate::config::source::get_config_source()
            .await
            .get_overlay_label()
            .await
            .context("Failed to get the overlay label"),
    }
}

async fn find_volume(driver: &RootDiskDriver, name: Option<&str>) -> Result<RootDiskVolume> {
    let name = volume_name(name).await?;
    driver
        .find(&name)
        .await
        .with_context(|| format!("Overlay volume `{name}` not found on the root disk"))
}
