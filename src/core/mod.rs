//! Core module - event bus, scheduler, clock and the engine tying them together

pub mod clock;
mod engine;
mod event_bus;
mod scheduler;

pub use engine::{Engine, TICK_INTERVAL};
pub use event_bus::{BusError, Callback, Event, EventBus, Payload, Subscription, Topic};
pub use scheduler::Scheduler;
