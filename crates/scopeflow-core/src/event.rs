/*!
 * Event system for ScopeFlow.
 *
 * A typed publish/subscribe bus. Devices publish their state and property
 * changes here; hosts subscribe to the event types they care about.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::types::Id;

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Event priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Routine notifications
    #[default]
    Normal,
    /// Failures the host should surface
    High,
}

/// An event stamped with its source and time of creation
#[derive(Debug, Clone)]
pub struct TypedEvent<T: Clone + Debug + Send + Sync + 'static> {
    /// Event type name
    pub event_type: &'static str,
    /// Source ID
    pub source: Option<Id>,
    /// Event priority
    pub priority: Priority,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Strongly-typed payload
    pub payload: T,
}

impl<T: Clone + Debug + Send + Sync + 'static> TypedEvent<T> {
    /// Create a new typed event
    pub fn new(event_type: &'static str, payload: T) -> Self {
        Self {
            event_type,
            source: None,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Set the source ID
    pub fn with_source(mut self, source: Id) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

type EventSender<T> = broadcast::Sender<T>;
type EventReceiver<T> = broadcast::Receiver<T>;

/// Event bus for publishing and subscribing to events
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    fn sender<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventSender<T>> {
        let type_id = TypeId::of::<T>();
        let mut channels = self.channels.lock().map_err(|_| Error::event("Failed to lock channels"))?;

        if let Some(sender) = channels.get(&type_id) {
            return sender
                .downcast_ref::<EventSender<T>>()
                .cloned()
                .ok_or_else(|| Error::event("Failed to downcast sender"));
        }

        let (sender, _) = broadcast::channel(self.channel_capacity);
        channels.insert(type_id, Box::new(sender.clone()));
        Ok(sender)
    }

    /// Publish an event, returning the number of receivers it reached
    ///
    /// Publishing with nobody subscribed is not an error.
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;

        if sender.receiver_count() == 0 {
            trace!("No receivers for event");
            return Ok(0);
        }

        sender.send(event).map_err(|e| {
            warn!("Failed to publish event: {}", e);
            Error::event(format!("Failed to publish event: {}", e))
        })
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Publish an event
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }
}

impl AsRef<EventBus> for SharedEventBus {
    fn as_ref(&self) -> &EventBus {
        &self.0
    }
}
