// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! MQTT notifier - publishes the alert to a broker topic

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tracing::{debug, info};

use super::NotifierBase;
use crate::alerts::{Notifier, PluginLoadError, PluginTable};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MqttNotifier {
    base: NotifierBase,
    broker: String,
    port: u16,
    topic: String,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
}

impl MqttNotifier {
    pub fn from_table(table: &PluginTable<'_>) -> Result<Arc<dyn Notifier>, PluginLoadError> {
        let base = NotifierBase::from_table(table)?;
        Ok(Arc::new(Self {
            base,
            broker: table.str("broker")?,
            port: table.u16_or("port", 1883)?,
            topic: table.opt_str("topic")?.unwrap_or_else(|| "overwatch/alarm".to_string()),
            client_id: table
                .opt_str("client_id")?
                .unwrap_or_else(|| format!("overwatch-{}", std::process::id())),
            username: table.opt_str("username")?,
            password: table.opt_str("password")?,
        }))
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(Duration::from_secs(5));
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

impl Notifier for MqttNotifier {
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
        let (mut client, mut connection) = Client::new(self.options(), 10);
        let payload = serde_json::to_vec(&json!({
            "message": message,
            "timestamp": chrono::Utc::now(),
        }))?;
        client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))?;

        let deadline = Instant::now() + ACK_TIMEOUT;
        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    let _ = client.disconnect();
                    info!("MQTT alert published to {}", self.topic);
                    return Ok(());
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => bail!("MQTT connection to {}:{} failed: {}", self.broker, self.port, e),
            }
            if Instant::now() > deadline {
                break;
            }
        }
        bail!("MQTT broker {} did not acknowledge the alert", self.broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_table() {
        let table: toml::Table = "enabled = false\ntest_grp = true\nbroker = \"localhost\"".parse().unwrap();
        let plugin = MqttNotifier::from_table(&PluginTable::new("mqtt", &table)).unwrap();
        assert_eq!(plugin.name(), "mqtt");
        assert!(!plugin.enabled());
        assert!(plugin.in_test_group());
    }
}
