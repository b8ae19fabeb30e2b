use documented::DocumentedFields;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, DocumentedFields)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Configuration related to creating the overlay filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayConfig>,

    /// Configuration related to running rootdisk as a boot service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<BootServiceConfig>,
}

impl GlobalConfig {
    pub fn f2fs_enabled(&self) -> bool {
        self.overlay.as_ref().is_some_and(|overlay| overlay.f2fs)
    }

    pub fn verbose(&self) -> bool {
        self.boot.as_ref().is_some_and(|boot| boot.verbose)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, DocumentedFields)]
#[serde(deny_unknown_fields)]
pub struct OverlayConfig {
    /// Format overlay regions larger than 100 MiB as F2FS instead of EXT4.
    #[serde(default = "Default::default")]
    pub f2fs: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, DocumentedFields)]
#[serde(deny_unknown_fields)]
pub struct BootServiceConfig {
    /// Enable this option if you want to see more log when setting up the overlay during boot.
    #[serde(default = "Default::default")]
    pub verbose: bool,
}
