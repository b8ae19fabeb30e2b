use anyhow::Result;
use async_trait::async_trait;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;

use crate::{
    cli::ShowOptions,
    disk::DiskInfo,
    driver::{rootdisk::RootDiskVolume, VolumeDriver as _},
    planner::OverlayTarget,
};

pub struct ShowCommand {
    pub show_options: ShowOptions,
}

#[async_trait]
impl super::Command for ShowCommand {
    async fn run(&self) -> Result<()> {
        let driver = super::rootdisk_driver().await?;
        let disk = driver.root_disk().await?;
        let name = super::volume_name(None).await?;
        let volume = driver.find(&name).await;

        println!(
            "Disk {} ({}, {} bytes, sector size {})",
            disk.dev.display(),
            if disk.ro { "ro" } else { "rw" },
            disk.size,
            disk.sector_size
        );
        if disk.partitioned() {
            println!("{}", disk_as_table(&disk, volume.as_ref()));
        }

        match &volume {
            Some(volume) => println!(
                "Overlay `{}`: {} at offset {}{}",
                volume.name,
                volume.target.device().display(),
                volume.target.offset(),
                if volume.creation_forbidden {
                    " (creation forbidden)"
                } else {
                    ""
                }
            ),
            None => println!("Overlay `{name}`: not found"),
        }

        Ok(())
    }
}

fn disk_as_table(disk: &DiskInfo, volume: Option<&RootDiskVolume>) -> Table {
    let overlay_device = volume.and_then(|volume| match &volume.target {
        OverlayTarget::Device { device } => Some(device),
        OverlayTarget::Region { .. } => None,
    });

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Device", "Partition", "Mode", "Start", "Size", "Role"]);

    for part in disk.partitions.iter() {
        let role = if part.rootfs {
            Cell::new("rootfs").fg(Color::Green)
        } else if overlay_device == Some(&part.dev) {
            Cell::new("overlay").fg(Color::Green)
        } else {
            Cell::new("<none>").fg(Color::DarkGrey)
        };

        table.add_row(vec![
            Cell::new(part.dev.display()),
            Cell::new(part.number),
            if part.ro {
                Cell::new("ro").fg(Color::Yellow)
            } else {
                Cell::new("rw")
            },
            Cell::new(part.start),
            Cell::new(part.size),
            role,
        ]);
    }

    table
}
