//! System module - alarm state machine, command pipeline and capture schedule

mod alarm;
mod commands;
mod schedule;
mod state_machine;

pub use alarm::{AlarmController, AlarmStateMachine, Effect, UNSILENCE_TIMER};
pub use commands::{Command, CommandError, CommandPipeline, CommandReply, CommandRequest, CommandSender};
pub use schedule::{is_scheduled, CaptureSchedule};
pub use state_machine::{Guard, Transition, TransitionError};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alarm system states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    On,
    Off,
    Alarm,
    Silenced,
    /// Reserved, no transitions lead here
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::On => "on",
            State::Off => "off",
            State::Alarm => "alarm",
            State::Silenced => "silenced",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot broadcast on every tick. Replaced, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub state: State,
    pub initial_alarm_time: Option<DateTime<Utc>>,
    pub silenced_until: Option<DateTime<Utc>>,
}

impl SystemStatus {
    pub fn new(timestamp: DateTime<Utc>, state: State) -> Self {
        Self {
            timestamp,
            state,
            initial_alarm_time: None,
            silenced_until: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_shape() {
        let status = SystemStatus::new(Utc::now(), State::Silenced);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "silenced");
        assert!(json.get("initialAlarmTime").is_some());
        assert!(json["silencedUntil"].is_null());
    }
}
