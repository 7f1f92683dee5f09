//! Realtime reconciliation
//!
//! Bridges gateway change feeds to the entity cache. Screens open a
//! watch for what they display; every event the watch delivers turns
//! into cache invalidation, and the next read re-pulls authoritative
//! state. Events are never applied as writes, so duplicates, replays
//! and reordering cannot corrupt anything.
//!
//! Watches are RAII guards: dropping one tears the feed down.

use std::sync::Arc;

use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{Collection, EntityId};
use crate::gateway::{ChangeEvent, RemoteGateway, Scope};
use crate::metrics::REALTIME_EVENTS_TOTAL;

pub struct RealtimeHub {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
}

/// Handle for an active watch; dropping it ends the subscription
pub struct WatchGuard {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RealtimeHub {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: Arc<EntityCache>) -> Self {
        Self { gateway, cache }
    }

    /// Watch a post's comments while its detail screen is open
    ///
    /// Each comment event drops the post's comment list and its
    /// hydrated view, so counts and the list re-pull together.
    pub fn watch_post(&self, post: &EntityId) -> WatchGuard {
        let comments_key =
            CacheKey::query(Collection::Comments, format!("post={}", post));
        let post_key =
            crate::service::FeedService::post_key(post, self.gateway.session().as_ref());
        let subscription = self
            .gateway
            .subscribe(Collection::Comments, Scope::Post(post.clone()));
        self.watch(subscription, move |cache, _event| {
            let comments_key = comments_key.clone();
            let post_key = post_key.clone();
            async move {
                cache.invalidate(&comments_key).await;
                cache.invalidate(&post_key).await;
            }
        })
    }

    /// Watch an open conversation for incoming messages
    pub fn watch_conversation(&self, conversation: &EntityId) -> WatchGuard {
        let messages_key = crate::service::ChatService::messages_key(conversation);
        let subscription = self
            .gateway
            .subscribe(Collection::Messages, Scope::Conversation(conversation.clone()));
        self.watch(subscription, move |cache, _event| {
            let messages_key = messages_key.clone();
            async move {
                cache.invalidate(&messages_key).await;
                // Inbox ordering and unread counts shift with every message.
                cache.invalidate_collection(Collection::Conversations);
            }
        })
    }

    /// Watch the viewer's notification stream
    pub fn watch_notifications(&self, user: &EntityId) -> WatchGuard {
        let subscription = self
            .gateway
            .subscribe(Collection::Notifications, Scope::User(user.clone()));
        self.watch(subscription, move |cache, _event| async move {
            cache.invalidate_collection(Collection::Notifications);
        })
    }

    /// Watch for new posts while the feed is on screen
    pub fn watch_feed(&self) -> WatchGuard {
        let subscription = self.gateway.subscribe(Collection::Posts, Scope::All);
        self.watch(subscription, move |cache, _event| async move {
            cache.invalidate_collection(Collection::Posts);
        })
    }

    fn watch<F, Fut>(&self, mut subscription: crate::gateway::Subscription, apply: F) -> WatchGuard
    where
        F: Fn(Arc<EntityCache>, ChangeEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let cache = Arc::clone(&self.cache);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                REALTIME_EVENTS_TOTAL
                    .with_label_values(&[event.collection.as_str(), event.kind.as_str()])
                    .inc();
                tracing::debug!(
                    collection = %event.collection,
                    kind = event.kind.as_str(),
                    id = event.id.as_str(),
                    "change event"
                );
                apply(Arc::clone(&cache), event).await;
            }
        });
        WatchGuard { task }
    }
}
