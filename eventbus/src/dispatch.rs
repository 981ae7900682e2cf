//! In-process fan-out of decoded events to local handlers.

use dashmap::{DashMap, DashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::{Error, Event, Result};

pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Name that subscribes to every event.
pub const WILDCARD: &str = "*";

/// Dispatch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every version of one event name.
    Name(String),
    /// One version of one event name, keyed `name:version`.
    Versioned(String, u32),
    /// Every event.
    Wildcard,
}

impl Channel {
    pub fn new(name: &str, version: Option<u32>) -> Self {
        match (name, version) {
            (WILDCARD, _) => Self::Wildcard,
            (name, Some(version)) => Self::Versioned(name.to_string(), version),
            (name, None) => Self::Name(name.to_string()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Versioned(name, version) => write!(f, "{name}:{version}"),
            Self::Wildcard => write!(f, "{WILDCARD}"),
        }
    }
}

/// An event a process consumes, as registered with the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription {
    pub name: String,
    pub version: Option<u32>,
}

/// Local pub/sub keyed by [`Channel`].
#[derive(Default)]
pub struct Emitter {
    handlers: DashMap<Channel, Vec<Handler>>,
    subscriptions: DashSet<Subscription>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, channel: Channel, handler: F)
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .entry(channel)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribe to `name` (any version when `version` is `None`) and record
    /// the subscription so a consumer registers its service for it.
    pub fn receive<F>(&self, name: &str, version: Option<u32>, handler: F)
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(Channel::new(name, version), handler);
        self.subscriptions.insert(Subscription {
            name: name.to_string(),
            version,
        });
    }

    /// Recorded subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<_> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        subscriptions.sort();
        subscriptions
    }

    /// Distinct event names to register in the store. The wildcard is local only.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscriptions()
            .into_iter()
            .map(|s| s.name)
            .filter(|name| name != WILDCARD)
            .collect();
        names.dedup();
        names
    }

    /// Run every handler of `channel`. Handlers are isolated from each other:
    /// all of them run, and the first failure is returned.
    pub fn publish(&self, channel: &Channel, event: &Event) -> Result<()> {
        // Clone out so handlers may subscribe without deadlocking the map.
        let handlers = match self.handlers.get(channel) {
            Some(handlers) => handlers.value().clone(),
            None => return Ok(()),
        };

        let mut first_error = None;
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::warn!(%channel, event_id = %event.meta.event_id, "Handler failed: {}", message);
            first_error.get_or_insert(Error::Handler {
                channel: channel.to_string(),
                message,
            });
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Publish to the event's name channel, its `name:version` channel and
    /// the wildcard channel. Each channel runs even if an earlier one failed.
    pub fn broadcast(&self, event: &Event) -> Result<()> {
        let mut channels = vec![Channel::Name(event.name().to_string())];
        if let Some(version) = event.version() {
            channels.push(Channel::Versioned(event.name().to_string(), version));
        }
        channels.push(Channel::Wildcard);

        let mut first_error = None;
        for channel in &channels {
            if let Err(e) = self.publish(channel, event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
