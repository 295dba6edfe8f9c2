//! Main engine - wires every component to the bus and runs them until shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use super::clock::SystemClock;
use super::{Event, EventBus, Scheduler, Topic};
use crate::alerts::{AlertFanout, NotifierRegistry};
use crate::capture::{ProcessLauncher, Supervisor, SupervisorService, WorkerLauncher};
use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::system::{AlarmController, AlarmStateMachine, CaptureSchedule, CommandPipeline};

/// Status broadcast period
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

const TICK_TASK: &str = "system_tick";

pub struct Engine {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<NotifierRegistry>,
}

impl Engine {
    /// Engine whose worker is this binary re-executed
    pub fn new(config: Config) -> Result<Self> {
        let launcher = ProcessLauncher::current_exe()?;
        Ok(Self::with_launcher(config, Arc::new(launcher)))
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config: Arc::new(config),
            bus: Arc::new(EventBus::new()),
            scheduler: Scheduler::new(),
            launcher,
            registry: Arc::new(NotifierRegistry::with_builtins()),
        }
    }

    pub fn with_registry(mut self, registry: NotifierRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Run until the shutdown topic fires or Ctrl-C. Any component failing
    /// is fatal and stops the rest.
    pub async fn run(self) -> Result<()> {
        info!("Starting overwatch engine...");
        let (shutdown_tx, _) = broadcast::channel::<()>(4);

        let trigger = shutdown_tx.clone();
        let shutdown_sub = self.bus.subscribe_fn(Topic::SystemShutdown, move |_| {
            info!("Shutdown event received");
            let _ = trigger.send(());
        })?;

        let machine = AlarmStateMachine::new(&self.config.alerting, Arc::new(SystemClock));
        let alarm = AlarmController::new(machine, self.bus.clone(), self.scheduler.clone());
        let mut subscriptions = alarm.subscribe()?;

        let pipeline = CommandPipeline::new(self.config.clone(), self.bus.clone(), alarm.clone(), self.scheduler.clone())?;

        let fanout = AlertFanout::new(self.config.clone(), self.registry.clone(), self.bus.clone());
        subscriptions.extend(fanout.subscribe()?);

        let metrics = MetricsCollector::new(self.bus.clone());
        subscriptions.push(metrics.subscribe()?);

        let schedule = CaptureSchedule::new(&self.config, self.bus.clone());
        subscriptions.push(schedule.subscribe()?);

        let supervisor = Supervisor::start(self.launcher.clone(), &self.config, Instant::now())
            .context("failed to start the detection worker")?;
        let service = SupervisorService::new(supervisor, self.bus.clone())?;

        schedule.start(&self.scheduler);
        let bus = self.bus.clone();
        self.scheduler.every(TICK_TASK, TICK_INTERVAL, move || {
            bus.publish(Topic::SystemTick, Event::empty());
        });

        let bus = self.bus.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                bus.publish(Topic::SystemShutdown, Event::empty());
            }
        });

        info!("Overwatch engine running");
        let result = tokio::try_join!(
            pipeline.run(shutdown_tx.subscribe()),
            service.run(shutdown_tx.subscribe()),
            fanout.run(shutdown_tx.subscribe()),
            metrics.run(shutdown_tx.subscribe()),
        );
        if let Err(e) = &result {
            error!("Engine component failed: {:#}", e);
        }

        info!("Stopping overwatch engine...");
        ctrl_c.abort();
        self.scheduler.cancel_all();
        subscriptions.push(shutdown_sub);
        self.bus.release(subscriptions);
        service.stop().await?;
        info!("Overwatch engine stopped");

        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureControl, SupervisorError, WorkerHandle, WorkerHeartbeat, WorkerSettings};
    use crate::capture::protocol::ProtocolError;
    use crate::core::Payload;
    use crate::system::{Command, CommandRequest, State};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counts {
        launches: usize,
        shutdowns: usize,
    }

    struct QuietLauncher(Arc<Mutex<Counts>>);

    struct QuietWorker(Arc<Mutex<Counts>>);

    impl WorkerLauncher for QuietLauncher {
        fn launch(&self, _settings: &WorkerSettings) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
            self.0.lock().launches += 1;
            Ok(Box::new(QuietWorker(self.0.clone())))
        }
    }

    impl WorkerHandle for QuietWorker {
        fn pid(&self) -> u32 {
            7
        }

        fn send_control(&mut self, _control: CaptureControl) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn try_recv_heartbeat(&mut self) -> Option<WorkerHeartbeat> {
            None
        }

        fn try_recv_frame(&mut self) -> Option<Vec<u8>> {
            None
        }

        fn shutdown(&mut self, _grace: Duration) {
            self.0.lock().shutdowns += 1;
        }
    }

    #[tokio::test]
    async fn test_runs_until_shutdown_command() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let mut config = Config::default();
        config.flags.test = true;
        let engine = Engine::with_launcher(config, Arc::new(QuietLauncher(counts.clone())));
        let bus = engine.bus();

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        bus.subscribe_fn(Topic::SystemStatusUpdate, move |event| {
            if let Payload::Status(status) = &event.data {
                sink.lock().push(status.state);
            }
        })
        .unwrap();

        let handle = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        bus.publish(
            Topic::CommandRequest,
            Event::new(Payload::Command(CommandRequest::new(None, Command::Shutdown { shutdown_in: 0 }))),
        );

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let counts = counts.lock();
        assert_eq!(counts.launches, 1);
        assert_eq!(counts.shutdowns, 1);
        assert!(states.lock().contains(&State::On));
    }
}
