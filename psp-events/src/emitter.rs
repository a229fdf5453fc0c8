use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::DomainEvent;
use crate::EventCategory;
use crate::EventResult;
use crate::EventStore;

/// Receives events after they are durably stored. Observers are read-only
/// consumers (projections, notifications, metrics); they cannot veto a write.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &DomainEvent);
}

enum Selector {
    All,
    EventType(String),
    Category(EventCategory),
}

impl Selector {
    fn matches(&self, event: &DomainEvent) -> bool {
        match self {
            Selector::All => true,
            Selector::EventType(kind) => kind == &event.event_type,
            Selector::Category(category) => *category == event.category,
        }
    }
}

/// Writes events to the store and fans them out to subscribed observers.
/// Duplicate events (same `event_id`, or a replayed idempotent flow) are
/// neither re-stored nor re-dispatched.
pub struct EventEmitter {
    store: Arc<dyn EventStore>,
    observers: RwLock<Vec<(Selector, Arc<dyn EventObserver>)>>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub async fn subscribe_all(&self, observer: Arc<dyn EventObserver>) {
        let mut observers = self.observers.write().await;
        observers.push((Selector::All, observer));
    }

    pub async fn subscribe_type(&self, event_type: impl Into<String>, observer: Arc<dyn EventObserver>) {
        let mut observers = self.observers.write().await;
        observers.push((Selector::EventType(event_type.into()), observer));
    }

    pub async fn subscribe_category(
        &self,
        category: EventCategory,
        observer: Arc<dyn EventObserver>,
    ) {
        let mut observers = self.observers.write().await;
        observers.push((Selector::Category(category), observer));
    }

    /// Persists and dispatches one event. Returns whether it was new.
    pub async fn emit(&self, event: DomainEvent) -> EventResult<bool> {
        let is_new = self.store.append(event.clone()).await?;
        if is_new {
            self.dispatch(&event).await;
        }
        Ok(is_new)
    }

    /// Starts a batch bound to the caller's unit of work: events accumulate
    /// in memory and hit the store only on `commit`. Dropping the batch
    /// without committing discards everything.
    pub fn batch(&self) -> EventBatch<'_> {
        EventBatch {
            emitter: self,
            events: Vec::new(),
        }
    }

    async fn dispatch(&self, event: &DomainEvent) {
        let observers = self.observers.read().await;
        for (selector, observer) in observers.iter() {
            if selector.matches(event) {
                observer.on_event(event).await;
            }
        }
    }
}

pub struct EventBatch<'a> {
    emitter: &'a EventEmitter,
    events: Vec<DomainEvent>,
}

impl EventBatch<'_> {
    pub fn push(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Persists and dispatches every held event, returning how many were new.
    pub async fn commit(self) -> EventResult<usize> {
        let mut stored = 0;
        for event in self.events {
            if self.emitter.emit(event).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }
}
