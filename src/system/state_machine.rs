//! Declarative transitions with source sets and named guards

use std::fmt;

use thiserror::Error;

/// Outcome of a refused transition. The state is left untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("current state is {state}, {transition} allows transitions from [{allowed}]")]
    InvalidStartState {
        transition: &'static str,
        state: String,
        allowed: String,
    },

    #[error("{transition} refused, conditions not met: {}", .failed.join(", "))]
    ConditionsNotMet {
        transition: &'static str,
        failed: Vec<&'static str>,
    },
}

/// A guard predicate, already evaluated against the pre-transition state
#[derive(Debug, Clone, Copy)]
pub struct Guard {
    pub name: &'static str,
    pub passed: bool,
}

impl Guard {
    pub fn new(name: &'static str, passed: bool) -> Self {
        Self { name, passed }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transition<S: 'static> {
    pub name: &'static str,
    pub sources: &'static [S],
    pub target: S,
}

impl<S: Copy + PartialEq + fmt::Display> Transition<S> {
    /// Check `current` against the source set, then every guard.
    /// Returns the target state to commit.
    pub fn check(&self, current: S, guards: &[Guard]) -> Result<S, TransitionError> {
        if !self.sources.contains(&current) {
            return Err(TransitionError::InvalidStartState {
                transition: self.name,
                state: current.to_string(),
                allowed: self.sources.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", "),
            });
        }

        let failed: Vec<&'static str> = guards.iter().filter(|g| !g.passed).map(|g| g.name).collect();
        if !failed.is_empty() {
            return Err(TransitionError::ConditionsNotMet {
                transition: self.name,
                failed,
            });
        }
        Ok(self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::State;

    const RESET: Transition<State> = Transition {
        name: "alarm_reset",
        sources: &[State::Alarm],
        target: State::On,
    };

    #[test]
    fn test_source_set_checked_before_guards() {
        let err = RESET.check(State::Off, &[Guard::new("never", false)]).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidStartState { .. }));
        assert_eq!(err.to_string(), "current state is off, alarm_reset allows transitions from [alarm]");
    }

    #[test]
    fn test_all_failed_guards_reported() {
        let err = RESET
            .check(
                State::Alarm,
                &[Guard::new("a", false), Guard::new("b", true), Guard::new("c", false)],
            )
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::ConditionsNotMet {
                transition: "alarm_reset",
                failed: vec!["a", "c"],
            }
        );
        assert_eq!(RESET.check(State::Alarm, &[]), Ok(State::On));
    }
}
