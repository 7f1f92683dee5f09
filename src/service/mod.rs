//! Service layer
//!
//! Read services hydrate records into the view types the application
//! renders, caching them with stale-while-revalidate semantics. All
//! writes go through the [`mutation::MutationCoordinator`].

pub mod chat;
pub mod feed;
pub mod mutation;
pub mod notification;
pub mod profile;

pub use chat::ChatService;
pub use feed::FeedService;
pub use mutation::{ImageUpload, MutationCoordinator, ProfileChanges};
pub use notification::NotificationService;
pub use profile::ProfileService;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::data::cache::{CacheKey, EntityCache, Lookup};
use crate::error::Result;

/// Read through the cache with stale-while-revalidate
///
/// Fresh entries are returned as-is. Stale entries are returned
/// immediately while `fetch` rebuilds the entry in a background task;
/// the next read sees the refreshed copy. Only a miss awaits `fetch`.
pub(crate) async fn swr<F, Fut>(cache: &Arc<EntityCache>, key: CacheKey, fetch: F) -> Result<Arc<Value>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    match cache.get(&key).await {
        Lookup::Fresh(value) => Ok(value),
        Lookup::Stale(value) => {
            let cache = Arc::clone(cache);
            tokio::spawn(async move {
                match fetch().await {
                    Ok(fresh) => {
                        cache.put(key, fresh).await;
                    }
                    Err(error) => {
                        // The stale copy stays; the next read retries.
                        tracing::debug!(%error, "background refresh failed");
                    }
                }
            });
            Ok(value)
        }
        Lookup::Miss => {
            let value = fetch().await?;
            Ok(cache.put(key, value).await)
        }
    }
}

/// Deserialize a cached JSON value into a view type
pub(crate) fn decode<T: DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(serde_json::from_value(value.clone())?)
}

/// The signed-in user, or [`AppError::Unauthorized`]
pub(crate) fn require_session(
    gateway: &Arc<dyn crate::gateway::RemoteGateway>,
) -> Result<crate::data::models::EntityId> {
    gateway.session().ok_or(crate::error::AppError::Unauthorized)
}
