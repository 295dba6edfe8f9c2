// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Alarm state machine
//!
//! [`AlarmStateMachine`] is pure: each transition checks its source set and
//! guards against the current state, commits, and hands back the side effects
//! for the caller to run. [`AlarmController`] owns the machine on the
//! coordinator, wires it to the bus and runs those effects after the lock is
//! released, so published events may safely re-enter the controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::state_machine::{Guard, Transition, TransitionError};
use super::{State, SystemStatus};
use crate::alerts::AlertData;
use crate::config::{AlertingConfig, Config};
use crate::core::clock::Clock;
use crate::core::{BusError, Event, EventBus, Payload, Scheduler, Subscription, Topic};

/// Scheduler name of the pending unsilence timer
pub const UNSILENCE_TIMER: &str = "unsilence";

const TURN_ON: Transition<State> = Transition {
    name: "turn_on",
    sources: &[State::Off, State::Silenced],
    target: State::On,
};

const TURN_OFF: Transition<State> = Transition {
    name: "turn_off",
    sources: &[State::On, State::Alarm, State::Silenced],
    target: State::Off,
};

const ALARM: Transition<State> = Transition {
    name: "alarm",
    sources: &[State::On, State::Alarm, State::Silenced],
    target: State::Alarm,
};

const SILENCE: Transition<State> = Transition {
    name: "silence",
    sources: &[State::On, State::Alarm, State::Silenced],
    target: State::Silenced,
};

const ALARM_RESET: Transition<State> = Transition {
    name: "alarm_reset",
    sources: &[State::Alarm],
    target: State::On,
};

const UNSILENCE: Transition<State> = Transition {
    name: "unsilence",
    sources: &[State::Silenced],
    target: State::On,
};

/// Work a committed transition asks its owner to do
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RaiseAlarm(AlertData),
    CancelUnsilence,
    ScheduleUnsilence(Duration),
}

pub struct AlarmStateMachine {
    state: State,
    status: SystemStatus,
    clock: Arc<dyn Clock>,
    alarm_hysteresis: chrono::Duration,
    initial_alarm_duration: chrono::Duration,
    last_alarm: Option<DateTime<Utc>>,
    initial_alarm: Option<DateTime<Utc>>,
}

impl AlarmStateMachine {
    /// Starts in ON
    pub fn new(alerting: &AlertingConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let mut machine = Self {
            state: State::On,
            status: SystemStatus::new(now, State::On),
            clock,
            alarm_hysteresis: chrono::Duration::zero(),
            initial_alarm_duration: chrono::Duration::zero(),
            last_alarm: None,
            initial_alarm: None,
        };
        machine.update_config(alerting);
        machine
    }

    pub fn update_config(&mut self, alerting: &AlertingConfig) {
        self.alarm_hysteresis = chrono::Duration::seconds(i64::from(alerting.alarm_hysteresis_s));
        self.initial_alarm_duration = chrono::Duration::minutes(i64::from(alerting.initial_alarm_duration_m));
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn status(&self) -> &SystemStatus {
        &self.status
    }

    pub fn last_alarm(&self) -> Option<DateTime<Utc>> {
        self.last_alarm
    }

    fn not_silenced(&self) -> Guard {
        Guard::new("not_silenced", self.state != State::Silenced)
    }

    fn hysteresis_elapsed(&self, now: DateTime<Utc>) -> Guard {
        let elapsed = self.last_alarm.map_or(true, |last| now > last + self.alarm_hysteresis);
        Guard::new("alarm_hysteresis_elapsed", elapsed)
    }

    fn commit(&mut self, transition: &Transition<State>, guards: &[Guard]) -> Result<(), TransitionError> {
        self.state = transition.check(self.state, guards)?;
        debug!("System state changed to {} via {}", self.state, transition.name);
        Ok(())
    }

    fn refresh_status(&mut self, silenced_until: Option<DateTime<Utc>>) {
        self.status = SystemStatus {
            timestamp: self.clock.now(),
            state: self.state,
            initial_alarm_time: self.initial_alarm,
            silenced_until,
        };
    }

    pub fn turn_on(&mut self) -> Result<Vec<Effect>, TransitionError> {
        let guards = [self.not_silenced()];
        self.commit(&TURN_ON, &guards)?;
        self.refresh_status(None);
        Ok(Vec::new())
    }

    pub fn turn_off(&mut self) -> Result<Vec<Effect>, TransitionError> {
        let was_silenced = self.state == State::Silenced;
        self.commit(&TURN_OFF, &[])?;
        self.refresh_status(None);
        Ok(if was_silenced { vec![Effect::CancelUnsilence] } else { Vec::new() })
    }

    pub fn alarm(&mut self, data: AlertData) -> Result<Vec<Effect>, TransitionError> {
        let now = self.clock.now();
        let guards = [self.hysteresis_elapsed(now), self.not_silenced()];
        self.commit(&ALARM, &guards)?;

        self.last_alarm = Some(now);
        let expired = self
            .initial_alarm
            .map_or(true, |initial| now > initial + self.initial_alarm_duration);
        if expired {
            self.initial_alarm = Some(now);
        }
        self.refresh_status(None);
        Ok(vec![Effect::RaiseAlarm(data)])
    }

    pub fn silence(&mut self, duration: Duration) -> Result<Vec<Effect>, TransitionError> {
        self.commit(&SILENCE, &[])?;
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| self.clock.now().checked_add_signed(d));
        if until.is_none() {
            warn!("Silence of {:?} has no representable end time", duration);
        }
        self.refresh_status(until);
        Ok(vec![Effect::CancelUnsilence, Effect::ScheduleUnsilence(duration)])
    }

    pub fn alarm_reset(&mut self) -> Result<Vec<Effect>, TransitionError> {
        self.commit(&ALARM_RESET, &[])?;
        self.refresh_status(None);
        Ok(Vec::new())
    }

    /// Only ever called by the unsilence timer
    pub fn unsilence(&mut self) -> Result<Vec<Effect>, TransitionError> {
        self.commit(&UNSILENCE, &[])?;
        self.refresh_status(None);
        Ok(Vec::new())
    }

    /// Restamp the snapshot for the 1 Hz broadcast
    pub fn tick(&mut self) -> SystemStatus {
        self.status = SystemStatus {
            timestamp: self.clock.now(),
            ..self.status.clone()
        };
        self.status.clone()
    }
}

/// Bus-facing owner of the alarm state machine
#[derive(Clone)]
pub struct AlarmController {
    machine: Arc<Mutex<AlarmStateMachine>>,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
}

impl AlarmController {
    pub fn new(machine: AlarmStateMachine, bus: Arc<EventBus>, scheduler: Scheduler) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            bus,
            scheduler,
        }
    }

    pub fn subscribe(&self) -> Result<Vec<Subscription>, BusError> {
        let mut subscriptions = Vec::new();

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SystemTick, move |_| {
            let status = this.machine.lock().tick();
            this.bus.publish(Topic::SystemStatusUpdate, Event::new(Payload::Status(status)));
        })?);

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SystemConfigUpdate, move |event| {
            if let Payload::Config(config) = &event.data {
                this.update_config(config);
            }
        })?);

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::CaptureDetectionUpdate, move |event| {
            if let Payload::Detection(motion) = event.data {
                this.detection_update(motion);
            }
        })?);

        let this = self.clone();
        subscriptions.push(self.bus.subscribe_fn(Topic::SchedulerCaptureStop, move |event| {
            if let Payload::CaptureStop(stop) = event.data {
                this.capture_stop(stop);
            }
        })?);

        Ok(subscriptions)
    }

    fn update_config(&self, config: &Config) {
        debug!("State machine updating configuration");
        self.machine.lock().update_config(&config.alerting);
    }

    /// Motion is a continuous signal, refused transitions are retried on
    /// the next update
    pub fn detection_update(&self, motion_detected: bool) {
        let result = if motion_detected {
            self.machine.lock().alarm(AlertData::alarm())
        } else {
            self.machine.lock().alarm_reset()
        };
        match result {
            Ok(effects) => self.run_effects(effects),
            Err(e) => trace!("Detection transition refused: {}", e),
        }
    }

    fn capture_stop(&self, stop: bool) {
        let result = if stop {
            self.machine.lock().turn_off()
        } else {
            self.machine.lock().turn_on()
        };
        match result {
            Ok(effects) => self.run_effects(effects),
            Err(e) => trace!("State transition error: {}", e),
        }
    }

    pub fn silence(&self, duration: Duration) -> Result<(), TransitionError> {
        let effects = self.machine.lock().silence(duration)?;
        info!("System silenced for {:?}", duration);
        self.run_effects(effects);
        Ok(())
    }

    fn unsilence(&self) {
        let result = self.machine.lock().unsilence();
        match result {
            Ok(effects) => {
                info!("Unsilencing system");
                self.run_effects(effects);
            }
            Err(e) => debug!("Unsilence skipped: {}", e),
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RaiseAlarm(data) => {
                    self.bus.publish(Topic::SystemAlarm, Event::new(Payload::Alarm(data)));
                }
                Effect::CancelUnsilence => {
                    self.scheduler.cancel(UNSILENCE_TIMER);
                }
                Effect::ScheduleUnsilence(delay) => {
                    let this = self.clone();
                    self.scheduler.after(UNSILENCE_TIMER, delay, move || this.unsilence());
                }
            }
        }
    }

    pub fn state(&self) -> State {
        self.machine.lock().state()
    }

    pub fn status(&self) -> SystemStatus {
        self.machine.lock().status().clone()
    }
}
