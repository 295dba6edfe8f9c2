//! Daily capture schedule
//!
//! Publishes [`Topic::SchedulerCaptureStop`] once a second: `true` outside the
//! configured active window, `false` inside it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{AlertingConfig, Config};
use crate::core::{BusError, Event, EventBus, Payload, Scheduler, Subscription, Topic};

const SCHEDULE_TASK: &str = "capture_schedule";

/// Whether `now` falls in the window `start..end`. The window may wrap past
/// midnight; equal bounds mean always active.
pub fn is_scheduled(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

struct Window {
    start: NaiveTime,
    end: NaiveTime,
    stopped: Option<bool>,
}

#[derive(Clone)]
pub struct CaptureSchedule {
    window: Arc<Mutex<Window>>,
    bus: Arc<EventBus>,
    test_mode: bool,
}

impl CaptureSchedule {
    pub fn new(config: &Config, bus: Arc<EventBus>) -> Self {
        let (start, end) = window_bounds(&config.alerting);
        Self {
            window: Arc::new(Mutex::new(Window { start, end, stopped: None })),
            bus,
            test_mode: config.flags.test,
        }
    }

    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        let window = self.window.clone();
        self.bus.subscribe_fn(Topic::SystemConfigUpdate, move |event| {
            if let Payload::Config(config) = &event.data {
                let (start, end) = window_bounds(&config.alerting);
                let mut window = window.lock();
                window.start = start;
                window.end = end;
                debug!("Scheduler updated config times");
            }
        })
    }

    /// Start the 1 Hz task. Does nothing in test mode.
    pub fn start(&self, scheduler: &Scheduler) {
        if self.test_mode {
            warn!("Scheduler running in test mode");
            return;
        }
        let this = self.clone();
        scheduler.every(SCHEDULE_TASK, Duration::from_secs(1), move || {
            this.evaluate(Local::now().time());
        });
    }

    /// Publish the capture-stop flag for wall clock time `now`
    pub fn evaluate(&self, now: NaiveTime) -> bool {
        let stop = {
            let mut window = self.window.lock();
            let stop = !is_scheduled(now, window.start, window.end);
            if window.stopped != Some(stop) {
                if stop {
                    debug!("Capture not scheduled, sending stop event");
                } else {
                    debug!("Capture scheduled, sending start event");
                }
                window.stopped = Some(stop);
            }
            stop
        };
        self.bus
            .publish(Topic::SchedulerCaptureStop, Event::new(Payload::CaptureStop(stop)));
        stop
    }
}

/// Config is validated before it gets here; a bad time falls back to an
/// always-active window
fn window_bounds(alerting: &AlertingConfig) -> (NaiveTime, NaiveTime) {
    match (alerting.start(), alerting.end()) {
        (Ok(start), Ok(end)) => (start, end),
        _ => (NaiveTime::MIN, NaiveTime::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let (start, end) = (t(20, 0), t(8, 0));
        assert!(is_scheduled(t(22, 30), start, end));
        assert!(is_scheduled(t(3, 0), start, end));
        assert!(is_scheduled(t(20, 0), start, end));
        assert!(!is_scheduled(t(8, 0), start, end));
        assert!(!is_scheduled(t(12, 0), start, end));
    }

    #[test]
    fn test_window_same_day() {
        let (start, end) = (t(9, 0), t(17, 0));
        assert!(is_scheduled(t(12, 0), start, end));
        assert!(!is_scheduled(t(18, 0), start, end));
        assert!(!is_scheduled(t(8, 59), start, end));
        assert!(is_scheduled(t(0, 0), t(6, 0), t(6, 0)));
    }

    #[test]
    fn test_evaluate_publishes_and_follows_config() {
        let bus = Arc::new(EventBus::new());
        let schedule = CaptureSchedule::new(&Config::default(), bus.clone());
        schedule.subscribe().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(Topic::SchedulerCaptureStop, move |event| {
            if let Payload::CaptureStop(stop) = event.data {
                sink.lock().push(stop);
            }
        })
        .unwrap();

        assert!(schedule.evaluate(t(12, 0)));
        assert!(!schedule.evaluate(t(23, 0)));

        let mut config = Config::default();
        config.alerting.start_time = "10:00".to_string();
        config.alerting.end_time = "14:00".to_string();
        bus.publish(Topic::SystemConfigUpdate, Event::new(Payload::Config(Arc::new(config))));
        assert!(!schedule.evaluate(t(12, 0)));

        assert_eq!(*seen.lock(), vec![true, false, false]);
    }
}
