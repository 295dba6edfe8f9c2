// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Event bus for inter-component communication
//!
//! A synchronous observer registry: `publish` runs every subscriber of a
//! topic, in subscription order, on the caller's thread before returning.
//! There is no queueing. Callbacks must be short and hand real work off to
//! a task or the blocking pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::alerts::AlertData;
use crate::capture::CaptureMetrics;
use crate::config::Config;
use crate::metrics::MetricsData;
use crate::system::{CommandReply, CommandRequest, SystemStatus};

/// Channels carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    SystemTick,
    SystemShutdown,
    SystemStatusUpdate,
    SystemAlarm,
    SystemMetricsReady,
    SystemConfigUpdate,
    CaptureMetricsUpdate,
    CaptureDetectionUpdate,
    VideoRawUpdate,
    SchedulerCaptureStop,
    CommandRequest,
    CommandProcessed,
}

/// Event payloads
#[derive(Debug, Clone)]
pub enum Payload {
    Empty,
    Status(SystemStatus),
    Alarm(AlertData),
    Metrics(MetricsData),
    Config(Arc<Config>),
    CaptureMetrics(CaptureMetrics),
    Detection(bool),
    RawFrame(Arc<Vec<u8>>),
    CaptureStop(bool),
    Command(CommandRequest),
    Reply(CommandReply),
}

/// Timestamped, immutable event
#[derive(Debug, Clone)]
pub struct Event {
    pub created_at: DateTime<Utc>,
    pub data: Payload,
}

impl Event {
    pub fn new(data: Payload) -> Self {
        Self {
            created_at: Utc::now(),
            data,
        }
    }

    pub fn empty() -> Self {
        Self::new(Payload::Empty)
    }
}

/// Subscriber callback. Identity is the `Arc` allocation.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("callback already subscribed to {0:?}")]
    DuplicateSubscription(Topic),

    #[error("callback is not subscribed")]
    NotSubscribed,
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

struct Subscriber {
    id: u64,
    callback: Callback,
}

/// Central event bus for pub/sub communication
pub struct EventBus {
    register: Mutex<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let register = self.register.lock();
        let counts: HashMap<&Topic, usize> = register.iter().map(|(t, s)| (t, s.len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            register: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Invoke every subscriber of `topic` with `event`.
    ///
    /// The subscriber list is snapshotted first, so callbacks may publish,
    /// subscribe or unsubscribe without deadlocking. Changes take effect on
    /// the next publish.
    pub fn publish(&self, topic: Topic, event: Event) {
        let callbacks: Vec<Callback> = match self.register.lock().get(&topic) {
            Some(subscribers) => subscribers.iter().map(|s| s.callback.clone()).collect(),
            None => return,
        };

        trace!("Publishing {:?} to {} subscriber(s)", topic, callbacks.len());
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Register `callback` on `topic`.
    ///
    /// Fails if the same callback (same `Arc`) is already on that topic.
    pub fn subscribe(&self, topic: Topic, callback: Callback) -> Result<Subscription, BusError> {
        let mut register = self.register.lock();
        let subscribers = register.entry(topic).or_default();

        if subscribers.iter().any(|s| Arc::ptr_eq(&s.callback, &callback)) {
            return Err(BusError::DuplicateSubscription(topic));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, callback });
        Ok(Subscription { topic, id })
    }

    /// Convenience wrapper boxing a closure into a fresh [`Callback`]
    pub fn subscribe_fn<F>(&self, topic: Topic, f: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(f))
    }

    pub fn unsubscribe(&self, handle: Subscription) -> Result<(), BusError> {
        let mut register = self.register.lock();
        let subscribers = register
            .get_mut(&handle.topic)
            .ok_or(BusError::NotSubscribed)?;

        let position = subscribers
            .iter()
            .position(|s| s.id == handle.id)
            .ok_or(BusError::NotSubscribed)?;
        subscribers.remove(position);
        Ok(())
    }

    /// Unsubscribe every handle during teardown. Handles already gone are
    /// logged and skipped. Returns how many were removed.
    pub fn release<I>(&self, handles: I) -> usize
    where
        I: IntoIterator<Item = Subscription>,
    {
        let mut removed = 0;
        for handle in handles {
            match self.unsubscribe(handle) {
                Ok(()) => removed += 1,
                Err(e) => debug!("Releasing {:?} subscription: {}", handle.topic, e),
            }
        }
        removed
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.register.lock().get(&topic).map(Vec::len).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
