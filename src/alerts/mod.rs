// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Alerts module - notifier plugins and the alarm fan-out

mod fanout;
pub mod plugins;
mod registry;
mod retry;

pub use fanout::AlertFanout;
pub use registry::{NotifierFactory, NotifierRegistry, PluginLoadError, PluginTable};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};

/// One alarm, consumed once by the fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertData {
    pub message: String,
    pub is_test: bool,
    /// Notifiers to skip for a test alarm
    pub exclusion_list: Vec<String>,
}

impl AlertData {
    pub fn alarm() -> Self {
        Self {
            message: "Alarm".to_string(),
            is_test: false,
            exclusion_list: Vec::new(),
        }
    }

    pub fn test(excluded: Vec<String>) -> Self {
        Self {
            message: "Test, Test".to_string(),
            is_test: true,
            exclusion_list: excluded,
        }
    }
}

/// Notifier plugin capability
///
/// `run` is blocking and is always called on the blocking pool.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// Test group members are the only ones run for a test alarm
    fn in_test_group(&self) -> bool;

    fn run(&self, message: &str) -> anyhow::Result<()>;
}

/// Which plugins an alarm goes to
pub fn select_notifiers<'a>(
    plugins: &'a [std::sync::Arc<dyn Notifier>],
    alert: &AlertData,
) -> Vec<&'a std::sync::Arc<dyn Notifier>> {
    plugins
        .iter()
        .filter(|plugin| {
            !alert.is_test
                || (plugin.in_test_group() && !alert.exclusion_list.iter().any(|name| name == plugin.name()))
        })
        .collect()
}
