//! Siren notifier - runs an external command, e.g. playing a sound over ssh

use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use super::NotifierBase;
use crate::alerts::{Notifier, PluginLoadError, PluginTable};

pub struct SirenNotifier {
    base: NotifierBase,
    program: String,
    args: Vec<String>,
}

impl SirenNotifier {
    pub fn from_table(table: &PluginTable<'_>) -> Result<Arc<dyn Notifier>, PluginLoadError> {
        let base = NotifierBase::from_table(table)?;
        Ok(Arc::new(Self {
            base,
            program: table.str("program")?,
            args: table.str_list_or_empty("args")?,
        }))
    }
}

impl Notifier for SirenNotifier {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn enabled(&self) -> bool {
        self.base.enabled
    }

    fn in_test_group(&self) -> bool {
        self.base.test_grp
    }

    fn run(&self, _message: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("could not start {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        info!("Sent siren alert");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn siren(program: &str) -> Arc<dyn Notifier> {
        let table: toml::Table = format!("enabled = true\ntest_grp = true\nprogram = \"{}\"", program)
            .parse()
            .unwrap();
        SirenNotifier::from_table(&PluginTable::new("siren", &table)).unwrap()
    }

    #[test]
    fn test_exit_status_decides_outcome() {
        assert!(siren("true").run("Alarm").is_ok());
        assert!(siren("false").run("Alarm").is_err());
        assert!(siren("/no/such/siren").run("Alarm").is_err());
    }
}
