//! Notification reads
//!
//! The list is capped at the 50 most recent, newest first, with actor
//! profiles attached. Mark-all-read is a single bulk update followed
//! by invalidation; the badge count always comes from the backend.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{Collection, EntityId, Notification, NotificationView};
use crate::error::Result;
use crate::gateway::{Filter, Query, RemoteGateway};

use super::{decode, feed::fetch_profiles, require_session, swr};

const LIST_LIMIT: u64 = 50;

pub struct NotificationService {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
}

impl NotificationService {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: Arc<EntityCache>) -> Self {
        Self { gateway, cache }
    }

    fn list_key(viewer: &EntityId) -> CacheKey {
        CacheKey::query(Collection::Notifications, format!("list;viewer={}", viewer))
    }

    /// The viewer's 50 most recent notifications, newest first
    pub async fn list(&self) -> Result<Vec<NotificationView>> {
        let viewer = require_session(&self.gateway)?;
        let key = Self::list_key(&viewer);
        let gateway = Arc::clone(&self.gateway);
        let value = swr(&self.cache, key, move || async move {
            build_notification_views(gateway, viewer).await
        })
        .await?;
        decode(&value)
    }

    /// Unread notifications, for the bell badge
    pub async fn unread_count(&self) -> Result<u64> {
        let viewer = require_session(&self.gateway)?;
        Ok(self
            .gateway
            .count(
                Collection::Notifications,
                Filter::new()
                    .eq("user_id", viewer.as_str())
                    .eq("is_read", false),
            )
            .await?)
    }

    /// Flip every unread notification to read
    pub async fn mark_all_read(&self) -> Result<()> {
        let viewer = require_session(&self.gateway)?;
        self.gateway
            .update(
                Collection::Notifications,
                Filter::new()
                    .eq("user_id", viewer.as_str())
                    .eq("is_read", false),
                json!({"is_read": true}),
            )
            .await?;
        self.cache.invalidate_collection(Collection::Notifications);
        Ok(())
    }
}

async fn build_notification_views(
    gateway: Arc<dyn RemoteGateway>,
    viewer: EntityId,
) -> Result<Value> {
    let rows = gateway
        .select(
            Collection::Notifications,
            Query::filtered(Filter::new().eq("user_id", viewer.as_str()))
                .order_desc("created_at")
                .limit(LIST_LIMIT),
        )
        .await?;
    let notifications: Vec<Notification> = decode(&Value::Array(rows))?;

    let actors = fetch_profiles(
        &gateway,
        notifications
            .iter()
            .filter_map(|n| n.actor_id.clone())
            .collect(),
    )
    .await?;

    let views: Vec<NotificationView> = notifications
        .into_iter()
        .map(|notification| {
            let actor = notification
                .actor_id
                .as_ref()
                .and_then(|id| actors.get(id.as_str()))
                .cloned();
            NotificationView {
                notification,
                actor,
            }
        })
        .collect();
    Ok(serde_json::to_value(views)?)
}
