// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Alert fan-out
//!
//! Each alarm is handed to the selected notifiers on the blocking pool, so a
//! slow or failing notifier never holds up the bus. A reconciliation pass
//! once a second collects finished dispatches and logs failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::{select_notifiers, AlertData, Notifier, NotifierRegistry, RetryPolicy};
use crate::config::Config;
use crate::core::{BusError, Event, EventBus, Payload, Subscription, Topic};
use crate::system::{Command, CommandRequest, State};

/// Reconciliation period
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

struct Dispatch {
    plugin: String,
    handle: JoinHandle<Result<()>>,
}

struct FanoutState {
    config: Arc<Config>,
    plugins: Vec<Arc<dyn Notifier>>,
    pending: Vec<Dispatch>,
    last_state: Option<State>,
}

#[derive(Clone)]
pub struct AlertFanout {
    state: Arc<Mutex<FanoutState>>,
    registry: Arc<NotifierRegistry>,
    retry: RetryPolicy,
    bus: Arc<EventBus>,
}

impl AlertFanout {
    pub fn new(config: Arc<Config>, registry: Arc<NotifierRegistry>, bus: Arc<EventBus>) -> Self {
        let plugins = registry.load(&config.alerters);
        Self {
            state: Arc::new(Mutex::new(FanoutState {
                config,
                plugins,
                pending: Vec::new(),
                last_state: None,
            })),
            registry,
            retry: RetryPolicy::default(),
            bus,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn subscribe(&self) -> Result<Vec<Subscription>, BusError> {
        let mut subscriptions = Vec::new();

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SystemAlarm, move |event| {
            if let Payload::Alarm(alert) = &event.data {
                this.dispatch(alert);
            }
        })?);

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SystemConfigUpdate, move |event| {
            if let Payload::Config(config) = &event.data {
                this.reload(config.clone());
            }
        })?);

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SystemStatusUpdate, move |event| {
            if let Payload::Status(status) = &event.data {
                this.status_update(status.state);
            }
        })?);

        Ok(subscriptions)
    }

    /// Queue the alert on every selected notifier. Never blocks.
    pub fn dispatch(&self, alert: &AlertData) {
        let mut state = self.state.lock();
        if state.config.flags.silent {
            info!("Silent mode, not dispatching '{}'", alert.message);
            return;
        }

        let selected: Vec<Arc<dyn Notifier>> = select_notifiers(&state.plugins, alert).into_iter().cloned().collect();
        for plugin in selected {
            let name = plugin.name().to_string();
            let message = alert.message.clone();
            let retry = self.retry.clone();
            let handle = tokio::task::spawn_blocking(move || raise_alert(plugin.as_ref(), &retry, &message));
            state.pending.push(Dispatch { plugin: name, handle });
        }
    }

    fn reload(&self, config: Arc<Config>) {
        debug!("Updating notifier configs");
        let plugins = self.registry.load(&config.alerters);
        let mut state = self.state.lock();
        state.plugins = plugins;
        state.config = config;
    }

    fn status_update(&self, new_state: State) {
        let updated = {
            let mut state = self.state.lock();
            if state.last_state == Some(new_state) {
                return;
            }
            state.last_state = Some(new_state);
            if new_state != State::On {
                return;
            }
            match re_enabled(&state.config) {
                Some(config) => config,
                None => return,
            }
        };

        debug!("Re-enabling notifiers");
        let request = CommandRequest::new(
            None,
            Command::ConfigUpdate {
                config: Box::new(updated),
            },
        );
        self.bus
            .publish(Topic::CommandRequest, Event::new(Payload::Command(request)));
    }

    /// Collect finished dispatches and log the failures. Dispatches still
    /// in flight stay pending for the next pass.
    pub async fn reconcile(&self) {
        let finished: Vec<Dispatch> = {
            let mut state = self.state.lock();
            let (finished, in_flight): (Vec<Dispatch>, Vec<Dispatch>) =
                std::mem::take(&mut state.pending)
                    .into_iter()
                    .partition(|d| d.handle.is_finished());
            state.pending = in_flight;
            finished
        };
        if finished.is_empty() {
            return;
        }
        let (names, handles): (Vec<String>, Vec<JoinHandle<Result<()>>>) =
            finished.into_iter().map(|d| (d.plugin, d.handle)).unzip();

        for (name, result) in names.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(())) => debug!("Pending alerter {} completed", name),
                Ok(Err(e)) => error!("Notifier {} failed: {:#}", name, e),
                Err(e) => error!("Notifier {} panicked: {}", name, e),
            }
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting alert fan-out...");
        let mut ticker = interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                _ = shutdown.recv() => {
                    info!("Alert fan-out shutting down...");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.state.lock().plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

fn raise_alert(plugin: &dyn Notifier, retry: &RetryPolicy, message: &str) -> Result<()> {
    if !plugin.enabled() {
        info!("Notifier {} not run due to being disabled", plugin.name());
        return Ok(());
    }
    retry.run(plugin.name(), || plugin.run(message))
}

/// Copy of `config` with every disabled notifier switched on, or `None`
/// when all of them already are
fn re_enabled(config: &Config) -> Option<Config> {
    let mut updated = config.clone();
    let mut changed = false;
    for table in updated.alerters.values_mut() {
        if table.get("enabled").and_then(toml::Value::as_bool) == Some(false) {
            table.insert("enabled".to_string(), toml::Value::Boolean(true));
            changed = true;
        }
    }
    changed.then_some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{PluginLoadError, PluginTable};
    use crate::system::SystemStatus;
    use anyhow::anyhow;
    use chrono::Utc;
    use std::collections::BTreeMap;

    static CALLS: Mutex<Vec<(String, String)>> = parking_lot::const_mutex(Vec::new());

    struct Recorder {
        name: String,
        enabled: bool,
        test_grp: bool,
        fail: bool,
        delay: Duration,
    }

    impl Notifier for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn in_test_group(&self) -> bool {
            self.test_grp
        }

        fn run(&self, message: &str) -> Result<()> {
            CALLS.lock().push((self.name.clone(), message.to_string()));
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(anyhow!("{} is broken", self.name));
            }
            Ok(())
        }
    }

    fn recorder(table: &PluginTable<'_>) -> Result<Arc<dyn Notifier>, PluginLoadError> {
        Ok(Arc::new(Recorder {
            name: table.plugin().to_string(),
            enabled: table.bool("enabled")?,
            test_grp: table.bool("test_grp")?,
            fail: table.bool("fail").unwrap_or(false),
            delay: Duration::from_millis(table.u16_or("delay_ms", 0)?.into()),
        }))
    }

    fn config(entries: &[(&str, &str)]) -> Config {
        let mut alerters = BTreeMap::new();
        for (name, src) in entries {
            alerters.insert(name.to_string(), src.parse::<toml::Table>().unwrap());
        }
        Config {
            alerters,
            ..Config::default()
        }
    }

    fn fanout(config: Config, bus: Arc<EventBus>) -> AlertFanout {
        let mut registry = NotifierRegistry::new();
        for name in ["a", "b", "c", "d", "e", "slow"] {
            registry.register(name, recorder);
        }
        let fanout = AlertFanout::new(Arc::new(config), Arc::new(registry), bus).with_retry(RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            backoff: 2,
        });
        fanout.subscribe().unwrap();
        fanout
    }

    async fn settle(fanout: &AlertFanout) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while fanout.pending() > 0 {
                fanout.reconcile().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn calls_for(prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = CALLS
            .lock()
            .iter()
            .filter(|(_, msg)| msg.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_selection() {
        let plugins: Vec<Arc<dyn Notifier>> = ["x", "y", "z"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Arc::new(Recorder {
                    name: name.to_string(),
                    enabled: true,
                    test_grp: i != 2,
                    fail: false,
                    delay: Duration::ZERO,
                }) as Arc<dyn Notifier>
            })
            .collect();

        let names = |alert: &AlertData| -> Vec<String> {
            select_notifiers(&plugins, alert).iter().map(|p| p.name().to_string()).collect()
        };
        assert_eq!(names(&AlertData::alarm()), vec!["x", "y", "z"]);
        assert_eq!(names(&AlertData::test(vec!["y".to_string()])), vec!["x"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_others() {
        let bus = Arc::new(EventBus::new());
        let fanout = fanout(
            config(&[
                ("a", "enabled = true\ntest_grp = true\nfail = true"),
                ("b", "enabled = true\ntest_grp = true"),
                ("c", "enabled = false\ntest_grp = true"),
            ]),
            bus.clone(),
        );
        let alert = AlertData {
            message: "fanout-failure".to_string(),
            is_test: false,
            exclusion_list: Vec::new(),
        };
        bus.publish(Topic::SystemAlarm, Event::new(Payload::Alarm(alert)));
        assert_eq!(fanout.pending(), 3);

        settle(&fanout).await;
        // a retried once, c skipped while disabled
        assert_eq!(calls_for("fanout-failure"), vec!["a", "a", "b"]);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_in_flight_dispatches() {
        let bus = Arc::new(EventBus::new());
        let fanout = fanout(config(&[("slow", "enabled = true\ntest_grp = true\ndelay_ms = 600")]), bus);
        fanout.dispatch(&AlertData {
            message: "fanout-slow".to_string(),
            is_test: false,
            exclusion_list: Vec::new(),
        });

        let started = std::time::Instant::now();
        fanout.reconcile().await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(fanout.pending(), 1);

        settle(&fanout).await;
        assert_eq!(calls_for("fanout-slow"), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_silent_mode_dispatches_nothing() {
        let bus = Arc::new(EventBus::new());
        let mut cfg = config(&[("d", "enabled = true\ntest_grp = true")]);
        cfg.flags.silent = true;
        let fanout = fanout(cfg, bus.clone());
        fanout.dispatch(&AlertData::alarm());
        assert_eq!(fanout.pending(), 0);
    }

    #[tokio::test]
    async fn test_back_to_on_re_enables_notifiers() {
        let bus = Arc::new(EventBus::new());
        let fanout = fanout(
            config(&[("e", "enabled = false\ntest_grp = true"), ("b", "enabled = true\ntest_grp = true")]),
            bus.clone(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));
        let sink = requests.clone();
        bus.subscribe_fn(Topic::CommandRequest, move |event| {
            if let Payload::Command(request) = &event.data {
                sink.lock().push(request.clone());
            }
        })
        .unwrap();

        let status = |state| Event::new(Payload::Status(SystemStatus::new(Utc::now(), state)));
        bus.publish(Topic::SystemStatusUpdate, status(State::Off));
        assert!(requests.lock().is_empty());
        bus.publish(Topic::SystemStatusUpdate, status(State::On));
        bus.publish(Topic::SystemStatusUpdate, status(State::On));

        let requests = requests.lock();
        assert_eq!(requests.len(), 1);
        match &requests[0].command {
            Command::ConfigUpdate { config } => {
                assert_eq!(config.alerter_enabled("e"), Some(true));
                assert_eq!(config.alerter_enabled("b"), Some(true));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(fanout.plugin_names(), vec!["b", "e"]);
    }
}
