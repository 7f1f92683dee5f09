//! In-memory gateway binding
//!
//! Backend stand-in for tests: JSON tables behind a lock, a broadcast
//! change feed, and the same uniqueness rules the hosted schema
//! enforces. Supports scripted fault injection so mutation rollback
//! paths can be exercised deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::data::models::{Collection, EntityId, NotificationKind};

use super::{
    ChangeEvent, ChangeKind, Direction, Filter, GatewayError, Query, RemoteGateway, Scope,
    Subscription,
};

/// All-in-memory backend with the hosted schema's uniqueness rules
pub struct InMemoryGateway {
    tables: RwLock<HashMap<Collection, Vec<Value>>>,
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
    changes: broadcast::Sender<(ChangeEvent, Value)>,
    session: RwLock<Option<EntityId>>,
    /// Errors returned by upcoming write operations, front first
    fail_next: Mutex<VecDeque<GatewayError>>,
    offline: AtomicBool,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            tables: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            changes,
            session: RwLock::new(None),
            fail_next: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn sign_in(&self, user: EntityId) {
        *self.session.write() = Some(user);
    }

    pub fn sign_out(&self) {
        *self.session.write() = None;
    }

    /// Load rows directly, without events or uniqueness checks
    pub fn seed(&self, collection: Collection, records: Vec<Value>) {
        self.tables.write().entry(collection).or_default().extend(records);
    }

    pub fn rows(&self, collection: Collection) -> Vec<Value> {
        self.tables
            .read()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Script the next write operation to fail with the given error
    pub fn fail_next(&self, error: GatewayError) {
        self.fail_next.lock().push_back(error);
    }

    /// Make every operation fail as unreachable until restored
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable("backend offline".to_string()));
        }
        Ok(())
    }

    fn take_scripted_failure(&self) -> Result<(), GatewayError> {
        match self.fail_next.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Unique-constraint columns for a collection, if any
    fn unique_columns(collection: Collection) -> Option<&'static [&'static str]> {
        match collection {
            Collection::Likes | Collection::Bookmarks => Some(&["user_id", "post_id"]),
            Collection::Follows => Some(&["follower_id", "following_id"]),
            Collection::Profiles => Some(&["username"]),
            _ => None,
        }
    }

    fn violates_uniqueness(collection: Collection, rows: &[Value], record: &Value) -> bool {
        // Conversations are unique per unordered user pair.
        if collection == Collection::Conversations {
            let a = record.get("user1_id");
            let b = record.get("user2_id");
            return rows.iter().any(|row| {
                (row.get("user1_id") == a && row.get("user2_id") == b)
                    || (row.get("user1_id") == b && row.get("user2_id") == a)
            });
        }
        match Self::unique_columns(collection) {
            Some(columns) => rows.iter().any(|row| {
                columns
                    .iter()
                    .all(|column| row.get(*column) == record.get(*column))
            }),
            None => false,
        }
    }

    /// Notification row a backend trigger would fan an interaction
    /// row out into, if any. The hosted schema creates these rows in
    /// triggers; clients only ever read them.
    fn notification_for(&self, collection: Collection, record: &Value) -> Option<Value> {
        let (recipient, actor, kind, post_id, comment_id) = match collection {
            Collection::Likes | Collection::Comments => {
                let actor = record.get("user_id")?.as_str()?.to_string();
                let post_id = record.get("post_id")?.as_str()?.to_string();
                let tables = self.tables.read();
                let author = tables
                    .get(&Collection::Posts)?
                    .iter()
                    .find(|row| row.get("id").and_then(Value::as_str) == Some(post_id.as_str()))?
                    .get("user_id")?
                    .as_str()?
                    .to_string();
                if collection == Collection::Likes {
                    (author, actor, NotificationKind::Like, Some(post_id), None)
                } else {
                    let comment_id = record.get("id").and_then(Value::as_str).map(String::from);
                    (author, actor, NotificationKind::Comment, Some(post_id), comment_id)
                }
            }
            Collection::Follows => {
                let actor = record.get("follower_id")?.as_str()?.to_string();
                let recipient = record.get("following_id")?.as_str()?.to_string();
                (recipient, actor, NotificationKind::Follow, None, None)
            }
            _ => return None,
        };
        if recipient == actor {
            return None;
        }
        Some(json!({
            "id": EntityId::new().as_str(),
            "user_id": recipient,
            "actor_id": actor,
            "type": kind.as_str(),
            "post_id": post_id,
            "comment_id": comment_id,
            "message_id": null,
            "is_read": false,
            "created_at": Utc::now().to_rfc3339(),
        }))
    }

    fn emit(&self, kind: ChangeKind, collection: Collection, record: &Value) {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let event = ChangeEvent {
            kind,
            collection,
            id: EntityId(id),
        };
        // No receivers is fine; the send result is irrelevant.
        let _ = self.changes.send((event, record.clone()));
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn select(&self, collection: Collection, query: Query) -> Result<Vec<Value>, GatewayError> {
        self.check_reachable()?;
        let mut rows: Vec<Value> = self
            .tables
            .read()
            .get(&collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((field, direction)) = &query.order {
            rows.sort_by(|a, b| {
                let a = a.get(field).and_then(Value::as_str).unwrap_or_default();
                let b = b.get(field).and_then(Value::as_str).unwrap_or_default();
                match direction {
                    Direction::Asc => a.cmp(b),
                    Direction::Desc => b.cmp(a),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn count(&self, collection: Collection, filter: Filter) -> Result<u64, GatewayError> {
        self.check_reachable()?;
        let count = self
            .tables
            .read()
            .get(&collection)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        self.check_reachable()?;
        self.take_scripted_failure()?;

        let mut record = record;
        let object = record
            .as_object_mut()
            .ok_or_else(|| GatewayError::Malformed("insert payload must be an object".to_string()))?;
        object
            .entry("id")
            .or_insert_with(|| json!(EntityId::new().as_str()));
        object
            .entry("created_at")
            .or_insert_with(|| json!(Utc::now().to_rfc3339()));

        {
            let mut tables = self.tables.write();
            let rows = tables.entry(collection).or_default();
            if Self::violates_uniqueness(collection, rows, &record) {
                return Err(GatewayError::Conflict(
                    "duplicate key value violates unique constraint".to_string(),
                ));
            }
            rows.push(record.clone());
        }

        self.emit(ChangeKind::Insert, collection, &record);

        if let Some(notification) = self.notification_for(collection, &record) {
            self.tables
                .write()
                .entry(Collection::Notifications)
                .or_default()
                .push(notification.clone());
            self.emit(ChangeKind::Insert, Collection::Notifications, &notification);
        }
        Ok(record)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: Filter,
        patch: Value,
    ) -> Result<Vec<Value>, GatewayError> {
        self.check_reachable()?;
        self.take_scripted_failure()?;

        let patch = patch
            .as_object()
            .ok_or_else(|| GatewayError::Malformed("update patch must be an object".to_string()))?
            .clone();

        let mut updated = Vec::new();
        {
            let mut tables = self.tables.write();
            let rows = tables.entry(collection).or_default();
            for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                if let Some(object) = row.as_object_mut() {
                    for (key, value) in &patch {
                        object.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }

        for row in &updated {
            self.emit(ChangeKind::Update, collection, row);
        }
        Ok(updated)
    }

    async fn delete(&self, collection: Collection, filter: Filter) -> Result<(), GatewayError> {
        self.check_reachable()?;
        self.take_scripted_failure()?;

        let removed: Vec<Value> = {
            let mut tables = self.tables.write();
            let rows = tables.entry(collection).or_default();
            let (gone, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|row| filter.matches(row));
            *rows = kept;
            gone
        };

        for row in &removed {
            self.emit(ChangeKind::Delete, collection, row);
        }
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        self.check_reachable()?;
        self.take_scripted_failure()?;
        self.blobs.write().insert(
            format!("{}/{}", bucket, path),
            (bytes, content_type.to_string()),
        );
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{}/{}", bucket, path)
    }

    fn subscribe(&self, collection: Collection, scope: Scope) -> Subscription {
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok((event, record)) => {
                        if event.collection != collection || !scope.matches(&record) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(collection, rx, task)
    }

    fn session(&self) -> Option<EntityId> {
        self.session.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_fills_id_and_created_at() {
        let gateway = InMemoryGateway::new();
        let stored = gateway
            .insert(Collection::Posts, json!({"content": "hi", "user_id": "u1"}))
            .await
            .unwrap();
        assert!(stored["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(stored["created_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn duplicate_like_conflicts() {
        let gateway = InMemoryGateway::new();
        let like = json!({"user_id": "u1", "post_id": "p1"});
        gateway.insert(Collection::Likes, like.clone()).await.unwrap();
        let err = gateway.insert(Collection::Likes, like).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn interaction_inserts_fan_out_notifications_like_the_backend() {
        let gateway = InMemoryGateway::new();
        gateway.seed(
            Collection::Posts,
            vec![json!({"id": "p1", "user_id": "author", "content": "hi", "created_at": "2026-01-01T00:00:00Z"})],
        );

        gateway
            .insert(Collection::Likes, json!({"user_id": "u1", "post_id": "p1"}))
            .await
            .unwrap();
        let notifications = gateway.rows(Collection::Notifications);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["user_id"], "author");
        assert_eq!(notifications[0]["actor_id"], "u1");
        assert_eq!(notifications[0]["type"], "like");

        // Interacting with your own content notifies nobody.
        gateway
            .insert(
                Collection::Comments,
                json!({"user_id": "author", "post_id": "p1", "content": "mine"}),
            )
            .await
            .unwrap();
        assert_eq!(gateway.rows(Collection::Notifications).len(), 1);
    }

    #[tokio::test]
    async fn conversation_pair_is_unique_regardless_of_order() {
        let gateway = InMemoryGateway::new();
        gateway
            .insert(
                Collection::Conversations,
                json!({"user1_id": "a", "user2_id": "b"}),
            )
            .await
            .unwrap();
        let err = gateway
            .insert(
                Collection::Conversations,
                json!({"user1_id": "b", "user2_id": "a"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn select_orders_and_limits() {
        let gateway = InMemoryGateway::new();
        gateway.seed(
            Collection::Messages,
            vec![
                json!({"id": "m1", "created_at": "2026-01-01T00:00:00Z"}),
                json!({"id": "m3", "created_at": "2026-01-03T00:00:00Z"}),
                json!({"id": "m2", "created_at": "2026-01-02T00:00:00Z"}),
            ],
        );
        let rows = gateway
            .select(
                Collection::Messages,
                Query::default().order_desc("created_at").limit(2),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "m3");
        assert_eq!(rows[1]["id"], "m2");
    }

    #[tokio::test]
    async fn subscription_delivers_only_scoped_changes() {
        let gateway = InMemoryGateway::new();
        let mut sub = gateway.subscribe(
            Collection::Comments,
            Scope::Post(EntityId("p1".to_string())),
        );
        tokio::task::yield_now().await;

        gateway
            .insert(Collection::Comments, json!({"post_id": "p2", "content": "no"}))
            .await
            .unwrap();
        let hit = gateway
            .insert(Collection::Comments, json!({"post_id": "p1", "content": "yes"}))
            .await
            .unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.id.as_str(), hit["id"].as_str().unwrap());
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let gateway = InMemoryGateway::new();
        gateway.fail_next(GatewayError::Unreachable("drop".to_string()));
        let err = gateway
            .insert(Collection::Likes, json!({"user_id": "u1", "post_id": "p1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));

        gateway
            .insert(Collection::Likes, json!({"user_id": "u1", "post_id": "p1"}))
            .await
            .unwrap();
    }
}
