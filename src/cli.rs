use clap::Parser;

use crate::build::CLAP_LONG_VERSION;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[clap(long, short = 'd')]
    /// Path to the root directory where to load configuration files. Default value is /etc/rootdisk.
    pub config_dir: Option<String>,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Locate the overlay volume and print where it lives.
    #[command(name = "find")]
    Find(FindOptions),

    /// Locate the overlay volume, expose it as a block device and create the overlay filesystem if missing.
    #[command(name = "init")]
    Init(InitOptions),

    /// Print the type of the filesystem found at the overlay location.
    #[command(name = "identify")]
    Identify(IdentifyOptions),

    /// Show the partitions of the disk holding the root filesystem.
    #[command(name = "show")]
    Show(ShowOptions),
}

#[derive(Parser, Debug)]
pub struct FindOptions {
    /// Name of the overlay volume. Defaults to the configured overlay label.
    pub name: Option<String>,

    /// Print the volume as JSON.
    #[clap(long, default_value = "false")]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InitOptions {
    /// Name of the overlay volume. Defaults to the configured overlay label.
    pub name: Option<String>,
}

#[derive(Parser, Debug)]
pub struct IdentifyOptions {
    /// Name of the overlay volume. Defaults to the configured overlay label.
    pub name: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ShowOptions {}
