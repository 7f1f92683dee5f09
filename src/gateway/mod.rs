//! Remote gateway
//!
//! Trait boundary between the synchronization core and the hosted
//! backend. Everything above this module speaks in collections,
//! filters and JSON records; the bindings below translate those to a
//! concrete transport.
//!
//! Two bindings ship: [`rest::RestGateway`] for a PostgREST-style
//! HTTP backend with object storage, and [`memory::InMemoryGateway`]
//! for tests.

pub mod memory;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::models::{Collection, EntityId};

// =============================================================================
// Errors
// =============================================================================

/// Transport-level failure reported by a gateway binding
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

// =============================================================================
// Filters and queries
// =============================================================================

/// A single comparison over one record field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the given JSON value
    Eq(String, Value),
    /// Field (as string) is one of the given values
    In(String, Vec<String>),
    /// Field (as string) sorts strictly after the given value
    ///
    /// Lexicographic, which is well ordered for RFC 3339 timestamps
    /// and ULIDs alike.
    Gt(String, String),
}

impl Condition {
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Condition::Eq(field, value) => record.get(field) == Some(value),
            Condition::In(field, values) => record
                .get(field)
                .and_then(Value::as_str)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Condition::Gt(field, bound) => record
                .get(field)
                .and_then(Value::as_str)
                .map(|v| v > bound.as_str())
                .unwrap_or(false),
        }
    }

    fn canonical(&self) -> String {
        match self {
            Condition::Eq(field, value) => match value.as_str() {
                Some(s) => format!("{}=eq.{}", field, s),
                None => format!("{}=eq.{}", field, value),
            },
            Condition::In(field, values) => {
                format!("{}=in.({})", field, values.join(","))
            }
            Condition::Gt(field, bound) => format!("{}=gt.{}", field, bound),
        }
    }
}

/// Disjunction of conjunctions over record fields
///
/// Built left to right: conditions chain with AND, [`Filter::or`]
/// opens a new alternative. An empty filter matches everything.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    groups: Vec<Vec<Condition>>,
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter {
    pub fn new() -> Self {
        Self {
            groups: vec![Vec::new()],
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn is_in(mut self, field: &str, values: Vec<String>) -> Self {
        self.push(Condition::In(field.to_string(), values));
        self
    }

    pub fn gt(mut self, field: &str, bound: &str) -> Self {
        self.push(Condition::Gt(field.to_string(), bound.to_string()));
        self
    }

    /// Start a new OR alternative; following conditions land in it
    pub fn or(mut self) -> Self {
        self.groups.push(Vec::new());
        self
    }

    fn push(&mut self, condition: Condition) {
        self.groups
            .last_mut()
            .expect("filter always has a current group")
            .push(condition);
    }

    pub fn groups(&self) -> &[Vec<Condition>] {
        &self.groups
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|condition| condition.matches(record)))
    }

    /// Deterministic descriptor, stable across identical builds
    pub fn canonical(&self) -> String {
        self.groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(Condition::canonical)
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => write!(f, "asc"),
            Direction::Desc => write!(f, "desc"),
        }
    }
}

/// A select: filter plus optional ordering and row limit
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<(String, Direction)>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            order: None,
            limit: None,
        }
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), Direction::Desc));
        self
    }

    pub fn order_asc(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), Direction::Asc));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cache key descriptor covering filter, order and limit
    pub fn canonical(&self) -> String {
        let mut descriptor = self.filter.canonical();
        if let Some((field, direction)) = &self.order {
            descriptor.push_str(&format!(";order={}.{}", field, direction));
        }
        if let Some(limit) = self.limit {
            descriptor.push_str(&format!(";limit={}", limit));
        }
        descriptor
    }
}

// =============================================================================
// Change feed
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A row-level change observed on the backend
///
/// Carries identity only. Consumers treat events as invalidation
/// signals and refetch through the cache; payloads are never applied
/// directly, so replays and reordering are harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub id: EntityId,
}

/// Row filter for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Rows whose `post_id` matches
    Post(EntityId),
    /// Rows whose `conversation_id` matches
    Conversation(EntityId),
    /// Rows whose `user_id` matches
    User(EntityId),
}

impl Scope {
    fn field(&self) -> Option<(&'static str, &EntityId)> {
        match self {
            Scope::All => None,
            Scope::Post(id) => Some(("post_id", id)),
            Scope::Conversation(id) => Some(("conversation_id", id)),
            Scope::User(id) => Some(("user_id", id)),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        match self.field() {
            None => true,
            Some((field, id)) => record
                .get(field)
                .and_then(Value::as_str)
                .map(|v| v == id.as_str())
                .unwrap_or(false),
        }
    }

    /// Server-side filter equivalent, used by bindings that poll
    pub fn to_filter(&self) -> Filter {
        match self.field() {
            None => Filter::new(),
            Some((field, id)) => Filter::new().eq(field, id.as_str()),
        }
    }
}

/// Live change feed for one collection and scope
///
/// Dropping the subscription detaches it: the delivery task aborts
/// and no further events arrive. Holders never need to unsubscribe
/// explicitly.
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    task: JoinHandle<()>,
    collection: Collection,
}

impl Subscription {
    pub fn new(
        collection: Collection,
        events: mpsc::Receiver<ChangeEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        crate::metrics::SUBSCRIPTIONS_ACTIVE
            .with_label_values(&[collection.as_str()])
            .inc();
        Self {
            events,
            task,
            collection,
        }
    }

    /// Next change, or `None` once the feed closes
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        crate::metrics::SUBSCRIPTIONS_ACTIVE
            .with_label_values(&[self.collection.as_str()])
            .dec();
    }
}

// =============================================================================
// Gateway trait
// =============================================================================

/// Transport to the hosted backend
///
/// All record payloads are JSON values shaped like the structs in
/// [`crate::data::models`]; bindings do not interpret them beyond the
/// fields their filters name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Rows matching the query, in its requested order
    async fn select(&self, collection: Collection, query: Query) -> Result<Vec<Value>, GatewayError>;

    /// Number of rows matching the filter, without fetching them
    async fn count(&self, collection: Collection, filter: Filter) -> Result<u64, GatewayError>;

    /// Insert one record, returning the stored representation
    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError>;

    /// Patch all rows matching the filter, returning them
    async fn update(
        &self,
        collection: Collection,
        filter: Filter,
        patch: Value,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Delete all rows matching the filter
    async fn delete(&self, collection: Collection, filter: Filter) -> Result<(), GatewayError>;

    /// Store a blob under `bucket/path`
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError>;

    /// Public URL a stored blob is served from
    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Open a change feed for one collection, filtered by scope
    fn subscribe(&self, collection: Collection, scope: Scope) -> Subscription;

    /// Authenticated user, if a session is active
    fn session(&self) -> Option<EntityId>;
}
