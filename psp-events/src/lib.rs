#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashSet;
use std::fmt::Display;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

mod emitter;
pub mod payloads;

pub use crate::emitter::EventBatch;
pub use crate::emitter::EventEmitter;
pub use crate::emitter::EventObserver;

pub type TenantId = Uuid;
pub type EventId = Uuid;
pub type CorrelationId = Uuid;

pub type EventResult<T> = Result<T, EventStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Funding,
    Payment,
    Ledger,
    Settlement,
    Liability,
    Reconciliation,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Funding => "funding",
            EventCategory::Payment => "payment",
            EventCategory::Ledger => "ledger",
            EventCategory::Settlement => "settlement",
            EventCategory::Liability => "liability",
            EventCategory::Reconciliation => "reconciliation",
        }
    }
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker for a typed event payload: the payload knows its wire name and
/// category, the envelope carries everything else.
pub trait EventPayload: Serialize {
    const EVENT_TYPE: &'static str;
    const CATEGORY: EventCategory;
}

/// An immutable domain fact. Stored once per `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub category: EventCategory,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub version: u16,
}

impl DomainEvent {
    pub fn new<P: EventPayload>(
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        payload: &P,
    ) -> EventResult<Self> {
        let payload = serde_json::to_value(payload).map_err(|err| {
            EventStoreError::Validation(format!(
                "failed to encode {} payload: {err}",
                P::EVENT_TYPE
            ))
        })?;
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: P::EVENT_TYPE.to_string(),
            category: P::CATEGORY,
            tenant_id,
            correlation_id,
            causation_id: None,
            timestamp: Utc::now(),
            payload,
            version: 1,
        })
    }

    pub fn caused_by(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFilter {
    pub tenant_id: TenantId,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub event_types: Option<Vec<String>>,
    pub categories: Option<Vec<EventCategory>>,
    pub limit: usize,
    pub offset: usize,
}

impl ReplayFilter {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            after: None,
            before: None,
            event_types: None,
            categories: None,
            limit: 1000,
            offset: 0,
        }
    }

    fn matches(&self, event: &DomainEvent) -> bool {
        if event.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(after) = self.after
            && event.timestamp <= after
        {
            return false;
        }
        if let Some(before) = self.before
            && event.timestamp >= before
        {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.iter().any(|kind| kind == &event.event_type)
        {
            return false;
        }
        if let Some(categories) = &self.categories
            && !categories.contains(&event.category)
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stores the event. Returns `false` when `event_id` was already present.
    async fn append(&self, event: DomainEvent) -> EventResult<bool>;

    /// Stores a batch, returning how many were new.
    async fn append_batch(&self, events: Vec<DomainEvent>) -> EventResult<usize>;

    async fn get_by_id(&self, event_id: EventId) -> EventResult<Option<DomainEvent>>;

    async fn get_by_correlation(
        &self,
        correlation_id: CorrelationId,
        tenant_id: Option<TenantId>,
    ) -> EventResult<Vec<DomainEvent>>;

    /// Events whose payload carries `{entity_type}_id == entity_id`.
    async fn get_by_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        tenant_id: Option<TenantId>,
    ) -> EventResult<Vec<DomainEvent>>;

    /// Matching events in ascending `(timestamp, event_id)` order.
    async fn replay(&self, filter: ReplayFilter) -> EventResult<Vec<DomainEvent>>;

    /// Count with the same filters; limit/offset are ignored.
    async fn count(&self, filter: ReplayFilter) -> EventResult<usize>;
}

#[derive(Default)]
pub struct InMemoryEventStore {
    state: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    events: Vec<DomainEvent>,
    seen: HashSet<EventId>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_chronologically(events: &mut [DomainEvent]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: DomainEvent) -> EventResult<bool> {
        let mut state = self.state.write().await;
        if !state.seen.insert(event.event_id) {
            return Ok(false);
        }
        state.events.push(event);
        Ok(true)
    }

    async fn append_batch(&self, events: Vec<DomainEvent>) -> EventResult<usize> {
        let mut state = self.state.write().await;
        let mut stored = 0;
        for event in events {
            if state.seen.insert(event.event_id) {
                state.events.push(event);
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn get_by_id(&self, event_id: EventId) -> EventResult<Option<DomainEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .find(|event| event.event_id == event_id)
            .cloned())
    }

    async fn get_by_correlation(
        &self,
        correlation_id: CorrelationId,
        tenant_id: Option<TenantId>,
    ) -> EventResult<Vec<DomainEvent>> {
        let state = self.state.read().await;
        let mut matches: Vec<DomainEvent> = state
            .events
            .iter()
            .filter(|event| event.correlation_id == correlation_id)
            .filter(|event| tenant_id.is_none_or(|tenant| event.tenant_id == tenant))
            .cloned()
            .collect();
        sort_chronologically(&mut matches);
        Ok(matches)
    }

    async fn get_by_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        tenant_id: Option<TenantId>,
    ) -> EventResult<Vec<DomainEvent>> {
        let entity_key = format!("{entity_type}_id");
        let entity_value = entity_id.to_string();
        let state = self.state.read().await;
        let mut matches: Vec<DomainEvent> = state
            .events
            .iter()
            .filter(|event| {
                event
                    .payload
                    .get(&entity_key)
                    .and_then(serde_json::Value::as_str)
                    == Some(entity_value.as_str())
            })
            .filter(|event| tenant_id.is_none_or(|tenant| event.tenant_id == tenant))
            .cloned()
            .collect();
        sort_chronologically(&mut matches);
        Ok(matches)
    }

    async fn replay(&self, filter: ReplayFilter) -> EventResult<Vec<DomainEvent>> {
        let state = self.state.read().await;
        let mut matches: Vec<DomainEvent> = state
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        sort_chronologically(&mut matches);
        Ok(matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn count(&self, filter: ReplayFilter) -> EventResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .count())
    }
}
