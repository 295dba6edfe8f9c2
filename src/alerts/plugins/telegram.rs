// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Telegram Bot API notifier

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use super::NotifierBase;
use crate::alerts::{Notifier, PluginLoadError, PluginTable};

const API_BASE: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    base: NotifierBase,
    api_key: String,
    chat_ids: Vec<String>,
    title: String,
}

impl TelegramNotifier {
    pub fn from_table(table: &PluginTable<'_>) -> Result<Arc<dyn Notifier>, PluginLoadError> {
        let base = NotifierBase::from_table(table)?;
        Ok(Arc::new(Self {
            base,
            api_key: table.str("api_key")?,
            chat_ids: table.str_list("chat_ids")?,
            title: table.opt_str("title")?.unwrap_or_else(|| "Overwatch".to_string()),
        }))
    }
}

impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn enabled(&self) -> bool {
        self.base.enabled
    }

    fn in_test_group(&self) -> bool {
        self.base.test_grp
    }

    fn run(&self, message: &str) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let url = format!("{}/bot{}/sendMessage", API_BASE, self.api_key);
        let text = format!("{}\n{}", self.title, message);

        for chat_id in &self.chat_ids {
            client
                .post(&url)
                .json(&json!({ "chat_id": chat_id, "text": text }))
                .send()
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("Telegram alerter failed to send to chat {}", chat_id))?;
        }
        info!("Telegram alert sent");
        Ok(())
    }
}
