//! Static notifier registry
//!
//! Plugins are registered by name with a factory; the `alerters` config
//! section decides which of them are built.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::plugins::{MqttNotifier, SirenNotifier, TelegramNotifier};
use super::Notifier;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginLoadError {
    #[error("no notifier named '{0}' is registered")]
    Unknown(String),

    #[error("notifier '{plugin}' is missing '{field}'")]
    MissingField { plugin: String, field: String },

    #[error("notifier '{plugin}' field '{field}' must be {expected}")]
    InvalidField {
        plugin: String,
        field: String,
        expected: &'static str,
    },
}

pub type NotifierFactory = fn(&PluginTable<'_>) -> Result<Arc<dyn Notifier>, PluginLoadError>;

/// Typed access to one plugin's config table
pub struct PluginTable<'a> {
    plugin: &'a str,
    table: &'a toml::Table,
}

impl<'a> PluginTable<'a> {
    pub fn new(plugin: &'a str, table: &'a toml::Table) -> Self {
        Self { plugin, table }
    }

    pub fn plugin(&self) -> &str {
        self.plugin
    }

    fn missing(&self, field: &str) -> PluginLoadError {
        PluginLoadError::MissingField {
            plugin: self.plugin.to_string(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, expected: &'static str) -> PluginLoadError {
        PluginLoadError::InvalidField {
            plugin: self.plugin.to_string(),
            field: field.to_string(),
            expected,
        }
    }

    fn get(&self, field: &str) -> Result<&'a toml::Value, PluginLoadError> {
        self.table.get(field).ok_or_else(|| self.missing(field))
    }

    pub fn bool(&self, field: &str) -> Result<bool, PluginLoadError> {
        self.get(field)?.as_bool().ok_or_else(|| self.invalid(field, "a boolean"))
    }

    pub fn str(&self, field: &str) -> Result<String, PluginLoadError> {
        self.get(field)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(field, "a string"))
    }

    pub fn opt_str(&self, field: &str) -> Result<Option<String>, PluginLoadError> {
        match self.table.get(field) {
            None => Ok(None),
            Some(_) => self.str(field).map(Some),
        }
    }

    pub fn u16_or(&self, field: &str, default: u16) -> Result<u16, PluginLoadError> {
        match self.table.get(field) {
            None => Ok(default),
            Some(value) => value
                .as_integer()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| self.invalid(field, "a port number")),
        }
    }

    /// List of strings; integers are accepted and stringified
    pub fn str_list(&self, field: &str) -> Result<Vec<String>, PluginLoadError> {
        let items = self.get(field)?.as_array().ok_or_else(|| self.invalid(field, "a list"))?;
        items
            .iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s.clone()),
                toml::Value::Integer(n) => Ok(n.to_string()),
                _ => Err(self.invalid(field, "a list of strings or integers")),
            })
            .collect()
    }

    pub fn str_list_or_empty(&self, field: &str) -> Result<Vec<String>, PluginLoadError> {
        if self.table.contains_key(field) {
            self.str_list(field)
        } else {
            Ok(Vec::new())
        }
    }
}

pub struct NotifierRegistry {
    factories: BTreeMap<&'static str, NotifierFactory>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in notifier
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("telegram", TelegramNotifier::from_table);
        registry.register("mqtt", MqttNotifier::from_table);
        registry.register("siren", SirenNotifier::from_table);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: NotifierFactory) {
        self.factories.insert(name, factory);
    }

    pub fn build(&self, name: &str, table: &toml::Table) -> Result<Arc<dyn Notifier>, PluginLoadError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginLoadError::Unknown(name.to_string()))?;
        factory(&PluginTable::new(name, table))
    }

    /// Build every configured notifier. One that fails to load is skipped.
    pub fn load(&self, alerters: &BTreeMap<String, toml::Table>) -> Vec<Arc<dyn Notifier>> {
        let mut plugins = Vec::new();
        for (name, table) in alerters {
            match self.build(name, table) {
                Ok(plugin) => {
                    info!("Loaded notifier {}", name);
                    plugins.push(plugin);
                }
                Err(e) => warn!("Failed to load notifier {}: {}", name, e),
            }
        }
        plugins
    }
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> toml::Table {
        src.parse().unwrap()
    }

    #[test]
    fn test_bad_plugin_skipped_others_load() {
        let mut alerters = BTreeMap::new();
        alerters.insert(
            "siren".to_string(),
            table("enabled = true\ntest_grp = false\nprogram = \"aplay\"\nargs = [\"siren.wav\"]"),
        );
        alerters.insert("telegram".to_string(), table("enabled = true\ntest_grp = true"));
        alerters.insert("pager".to_string(), table("enabled = true\ntest_grp = true"));

        let plugins = NotifierRegistry::with_builtins().load(&alerters);
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["siren"]);
    }

    #[test]
    fn test_errors_name_the_field() {
        let registry = NotifierRegistry::with_builtins();
        let err = registry
            .build("telegram", &table("enabled = true\ntest_grp = true\nchat_ids = [1]"))
            .err()
            .unwrap();
        assert_eq!(
            err,
            PluginLoadError::MissingField {
                plugin: "telegram".to_string(),
                field: "api_key".to_string(),
            }
        );

        let err = registry.build("mqtt", &table("enabled = 1\ntest_grp = true")).err().unwrap();
        assert!(matches!(err, PluginLoadError::InvalidField { .. }));
        assert_eq!(registry.build("pager", &toml::Table::new()).err(), Some(PluginLoadError::Unknown("pager".into())));
    }

    #[test]
    fn test_str_list_accepts_integers() {
        let t = table("ids = [12, \"-34\"]");
        let list = PluginTable::new("x", &t).str_list("ids").unwrap();
        assert_eq!(list, vec!["12".to_string(), "-34".to_string()]);
    }
}
