use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NetworkUp,
    NetworkDown,
    NetworkConfigChanged,
    MqttConfigChanged,
    TimeSynced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    NetworkUp { address: Ipv4Addr },
    NetworkDown,
    NetworkConfigChanged,
    MqttConfigChanged,
    TimeSynced { at: DateTime<Utc> },
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NetworkUp { .. } => EventKind::NetworkUp,
            Self::NetworkDown => EventKind::NetworkDown,
            Self::NetworkConfigChanged => EventKind::NetworkConfigChanged,
            Self::MqttConfigChanged => EventKind::MqttConfigChanged,
            Self::TimeSynced { .. } => EventKind::TimeSynced,
        }
    }
}

type Subscriber = Box<dyn FnMut(&AppEvent) + Send>;

/// Typed publish/subscribe. Each subscriber of an event's kind sees it once,
/// in registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        subscriber: impl FnMut(&AppEvent) + Send + 'static,
    ) {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Box::new(subscriber));
    }

    /// Raises `signal` whenever an event of `kind` is published.
    pub fn subscribe_signal(&mut self, kind: EventKind, signal: &Signal) {
        let signal = signal.clone();
        self.subscribe(kind, move |_| signal.raise());
    }

    pub fn publish(&mut self, event: &AppEvent) {
        debug!("event {:?}", event.kind());
        if let Some(subscribers) = self.subscribers.get_mut(&event.kind()) {
            for subscriber in subscribers.iter_mut() {
                subscriber(event);
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }
}

/// Shared one-shot flag: raised by a subscriber, consumed by the owning
/// component on its next poll.
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<AtomicBool>);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
