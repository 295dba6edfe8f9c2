// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Command pipeline - serialized execution of inbound control requests
//!
//! Requests arrive on the bus (or raw from a transport through
//! [`CommandSender::submit_raw`]), are queued, and are executed one at a
//! time by [`CommandPipeline::run`]. Every request yields exactly one reply
//! on [`Topic::CommandProcessed`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::alarm::AlarmController;
use super::state_machine::TransitionError;
use crate::alerts::AlertData;
use crate::config::{Config, ConfigError};
use crate::core::{Event, EventBus, Payload, Scheduler, Subscription, Topic};

/// Scheduler name of a pending shutdown
const SHUTDOWN_TIMER: &str = "shutdown";

/// Inbound command. The payload shape is fixed by the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum Command {
    Silence {
        #[serde(alias = "silenceFor")]
        silence_for: f64,
    },
    Test {
        excluded: Vec<String>,
    },
    ConfigUpdate {
        config: Box<Config>,
    },
    Shutdown {
        #[serde(alias = "shutdownIn")]
        shutdown_in: u64,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Silence { .. } => "silence",
            Command::Test { .. } => "test",
            Command::ConfigUpdate { .. } => "config_update",
            Command::Shutdown { .. } => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest {
    pub sender_id: Option<Uuid>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Deserialize)]
struct SenderField {
    #[serde(default, alias = "senderId")]
    sender_id: Option<Uuid>,
}

impl CommandRequest {
    pub fn new(sender_id: Option<Uuid>, command: Command) -> Self {
        Self { sender_id, command }
    }

    /// Parse a JSON request. On failure the sender id is still recovered
    /// when it was readable, so the rejection can be correlated.
    pub fn parse(raw: &str) -> Result<Self, (Option<Uuid>, CommandError)> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| (None, CommandError::Malformed(e.to_string())))?;
        let sender_id = serde_json::from_value::<SenderField>(value.clone())
            .map_err(|e| (None, CommandError::Malformed(e.to_string())))?
            .sender_id;
        let command =
            serde_json::from_value::<Command>(value).map_err(|e| (sender_id, CommandError::Malformed(e.to_string())))?;
        Ok(Self { sender_id, command })
    }
}

/// Reply correlated to a request by its sender id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok(sender_id: Option<Uuid>) -> Self {
        Self {
            sender_id,
            status: Some("OK".to_string()),
            error: None,
        }
    }

    pub fn error(sender_id: Option<Uuid>, error: impl ToString) -> Self {
        Self {
            sender_id,
            status: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Cloneable entry point into the command queue
#[derive(Clone)]
pub struct CommandSender {
    queue: mpsc::UnboundedSender<CommandRequest>,
    bus: Arc<EventBus>,
}

impl CommandSender {
    pub fn submit(&self, request: CommandRequest) {
        if self.queue.send(request).is_err() {
            warn!("Command pipeline stopped, dropping request");
        }
    }

    /// Queue a raw JSON request, replying at once if it does not parse
    pub fn submit_raw(&self, raw: &str) {
        match CommandRequest::parse(raw) {
            Ok(request) => self.submit(request),
            Err((sender_id, e)) => {
                debug!("Rejected command: {}", e);
                self.bus.publish(
                    Topic::CommandProcessed,
                    Event::new(Payload::Reply(CommandReply::error(sender_id, e))),
                );
            }
        }
    }
}

pub struct CommandPipeline {
    config: Arc<Config>,
    queue: mpsc::UnboundedReceiver<CommandRequest>,
    sender: CommandSender,
    bus: Arc<EventBus>,
    alarm: AlarmController,
    scheduler: Scheduler,
    subscription: Subscription,
}

impl CommandPipeline {
    /// Create the pipeline and start queueing bus command requests
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>, alarm: AlarmController, scheduler: Scheduler) -> Result<Self> {
        let (tx, queue) = mpsc::unbounded_channel();
        let sender = CommandSender { queue: tx, bus: bus.clone() };

        let inbound = sender.clone();
        let subscription = bus.subscribe_fn(Topic::CommandRequest, move |event| {
            if let Payload::Command(request) = &event.data {
                inbound.submit(request.clone());
            }
        })?;

        Ok(Self {
            config,
            queue,
            sender,
            bus,
            alarm,
            scheduler,
            subscription,
        })
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Single consumer: commands run strictly in arrival order
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting command pipeline...");
        loop {
            let request = tokio::select! {
                request = self.queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            debug!("Got command {}", request.command.name());

            let reply = match self.execute(request.command) {
                Ok(()) => CommandReply::ok(request.sender_id),
                Err(e) => {
                    debug!("Command failed: {}", e);
                    CommandReply::error(request.sender_id, e)
                }
            };
            self.bus.publish(Topic::CommandProcessed, Event::new(Payload::Reply(reply)));
        }
        self.bus.release([self.subscription]);
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::ConfigUpdate { config } => self.update_config(*config),
            Command::Shutdown { shutdown_in } => {
                let bus = self.bus.clone();
                info!("Shutdown requested in {}s", shutdown_in);
                self.scheduler
                    .after(SHUTDOWN_TIMER, Duration::from_secs(shutdown_in), move || {
                        bus.publish(Topic::SystemShutdown, Event::empty());
                    });
                Ok(())
            }
            Command::Silence { silence_for } => {
                let duration = Duration::try_from_secs_f64(silence_for)
                    .map_err(|e| CommandError::Malformed(format!("silence_for {}: {}", silence_for, e)))?;
                let representable = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .is_some();
                if !representable {
                    return Err(CommandError::Malformed(format!("silence_for {} is out of range", silence_for)));
                }
                self.alarm.silence(duration)?;
                Ok(())
            }
            Command::Test { excluded } => {
                info!("Test alarm requested, excluding {:?}", excluded);
                self.bus
                    .publish(Topic::SystemAlarm, Event::new(Payload::Alarm(AlertData::test(excluded))));
                Ok(())
            }
        }
    }

    fn update_config(&mut self, mut config: Config) -> Result<(), CommandError> {
        config.flags = self.config.flags.clone();
        config.validate()?;

        let config = Arc::new(config);
        self.config = config.clone();
        self.bus
            .publish(Topic::SystemConfigUpdate, Event::new(Payload::Config(config.clone())));

        if let Some(path) = config.flags.config_path.clone() {
            persist(config, path);
        }
        Ok(())
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

/// Write the config on the blocking pool without waiting for it
fn persist(config: Arc<Config>, path: PathBuf) {
    tokio::task::spawn_blocking(move || match config.save(&path) {
        Ok(()) => debug!("Saved config to {:?}", path),
        Err(e) => error!("Failed to save config to {:?}: {}", path, e),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertingConfig;
    use crate::core::clock::SystemClock;
    use crate::system::{AlarmStateMachine, State};
    use parking_lot::Mutex;

    struct Harness {
        bus: Arc<EventBus>,
        alarm: AlarmController,
        replies: Arc<Mutex<Vec<CommandReply>>>,
        sender: CommandSender,
        shutdown: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start() -> Harness {
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::new();
        let machine = AlarmStateMachine::new(&AlertingConfig::default(), Arc::new(SystemClock));
        let alarm = AlarmController::new(machine, bus.clone(), scheduler.clone());
        let pipeline = CommandPipeline::new(Arc::new(Config::default()), bus.clone(), alarm.clone(), scheduler).unwrap();
        let sender = pipeline.sender();

        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        bus.subscribe_fn(Topic::CommandProcessed, move |event| {
            if let Payload::Reply(reply) = &event.data {
                sink.lock().push(reply.clone());
            }
        })
        .unwrap();

        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(pipeline.run(rx));
        Harness {
            bus,
            alarm,
            replies,
            sender,
            shutdown,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn request(sender: Uuid, command: Command) -> Event {
        Event::new(Payload::Command(CommandRequest::new(Some(sender), command)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_in_order_with_one_reply_each() {
        let h = start();
        let alarms = Arc::new(Mutex::new(Vec::new()));
        let sink = alarms.clone();
        h.bus
            .subscribe_fn(Topic::SystemAlarm, move |event| {
                if let Payload::Alarm(data) = &event.data {
                    sink.lock().push(data.clone());
                }
            })
            .unwrap();

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        h.bus.publish(Topic::CommandRequest, request(a, Command::Silence { silence_for: 60.0 }));
        h.bus.publish(
            Topic::CommandRequest,
            request(
                b,
                Command::Test {
                    excluded: vec!["siren".to_string()],
                },
            ),
        );
        settle().await;

        let replies = h.replies.lock().clone();
        assert_eq!(replies, vec![CommandReply::ok(Some(a)), CommandReply::ok(Some(b))]);
        assert_eq!(h.alarm.state(), State::Silenced);
        let alarms = alarms.lock();
        assert_eq!(alarms.len(), 1);
        assert!(alarms[0].is_test);
        assert_eq!(alarms[0].exclusion_list, vec!["siren".to_string()]);

        h.shutdown.send(()).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_request_rejected_with_sender() {
        let h = start();
        let id = Uuid::new_v4();
        h.sender.submit_raw(&format!(
            r#"{{"sender_id":"{}","command":"silence","data":{{"excluded":[]}}}}"#,
            id
        ));
        h.sender.submit_raw("not json");
        settle().await;

        let replies = h.replies.lock().clone();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].sender_id, Some(id));
        assert!(!replies[0].is_ok());
        assert_eq!(replies[1].sender_id, None);
        assert_eq!(h.alarm.state(), State::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_silence_rejected() {
        let h = start();
        let id = Uuid::new_v4();
        h.bus.publish(Topic::CommandRequest, request(id, Command::Silence { silence_for: 1e15 }));
        settle().await;

        let replies = h.replies.lock().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sender_id, Some(id));
        assert!(replies[0].error.as_deref().unwrap_or_default().contains("out of range"));
        assert_eq!(h.alarm.state(), State::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let h = start();
        let updates = Arc::new(Mutex::new(0));
        let sink = updates.clone();
        h.bus
            .subscribe_fn(Topic::SystemConfigUpdate, move |_| *sink.lock() += 1)
            .unwrap();

        let mut bad = Config::default();
        bad.processing.fps = 0;
        h.bus.publish(
            Topic::CommandRequest,
            request(Uuid::new_v4(), Command::ConfigUpdate { config: Box::new(bad) }),
        );
        let mut good = Config::default();
        good.alerting.alarm_hysteresis_s = 5;
        h.bus.publish(
            Topic::CommandRequest,
            request(Uuid::new_v4(), Command::ConfigUpdate { config: Box::new(good) }),
        );
        settle().await;

        let replies = h.replies.lock().clone();
        assert!(replies[0].error.as_deref().unwrap_or_default().contains("fps"));
        assert!(replies[1].is_ok());
        assert_eq!(*updates.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_delayed() {
        let h = start();
        let fired = Arc::new(Mutex::new(false));
        let sink = fired.clone();
        h.bus
            .subscribe_fn(Topic::SystemShutdown, move |_| *sink.lock() = true)
            .unwrap();

        h.bus.publish(
            Topic::CommandRequest,
            request(Uuid::new_v4(), Command::Shutdown { shutdown_in: 2 }),
        );
        settle().await;
        assert!(!*fired.lock());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(*fired.lock());
    }

    #[test]
    fn test_parse_accepts_camel_case() {
        let request = CommandRequest::parse(r#"{"senderId":null,"command":"silence","data":{"silenceFor":30}}"#).unwrap();
        assert_eq!(request.command, Command::Silence { silence_for: 30.0 });

        let request = CommandRequest::parse(r#"{"command":"shutdown","data":{"shutdown_in":5}}"#).unwrap();
        assert_eq!(request.sender_id, None);
        assert_eq!(request.command, Command::Shutdown { shutdown_in: 5 });

        assert!(CommandRequest::parse(r#"{"command":"reboot","data":{}}"#).is_err());
    }

    #[test]
    fn test_reply_json() {
        let json = serde_json::to_value(CommandReply::ok(None)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "OK"}));
    }
}
