//! Built-in notifiers

mod mqtt;
mod siren;
mod telegram;

pub use mqtt::MqttNotifier;
pub use siren::SirenNotifier;
pub use telegram::TelegramNotifier;

use super::{PluginLoadError, PluginTable};

/// Settings every notifier table carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierBase {
    pub name: String,
    pub enabled: bool,
    pub test_grp: bool,
}

impl NotifierBase {
    pub fn from_table(table: &PluginTable<'_>) -> Result<Self, PluginLoadError> {
        Ok(Self {
            name: table.plugin().to_string(),
            enabled: table.bool("enabled")?,
            test_grp: table.bool("test_grp")?,
        })
    }
}
