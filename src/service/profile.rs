//! Profile reads
//!
//! Hydrates a profile with its follower and following counts and the
//! viewer's follow state. Edits go through the mutation coordinator.

use std::sync::Arc;

use serde_json::Value;

use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{Collection, EntityId, Profile, ProfileView};
use crate::error::{AppError, Result};
use crate::gateway::{Filter, Query, RemoteGateway};

use super::{decode, swr};

pub struct ProfileService {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
}

impl ProfileService {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: Arc<EntityCache>) -> Self {
        Self { gateway, cache }
    }

    /// Cache key for one viewer's view of a profile
    ///
    /// `is_following` is per-viewer, so the key embeds the viewer.
    pub fn profile_key(user: &EntityId, viewer: Option<&EntityId>) -> CacheKey {
        let viewer = viewer.map(EntityId::as_str).unwrap_or("anonymous");
        CacheKey::query(
            Collection::Profiles,
            format!("profile={};viewer={}", user, viewer),
        )
    }

    /// A profile hydrated for the profile screen
    pub async fn profile(&self, user: &EntityId) -> Result<ProfileView> {
        let viewer = self.gateway.session();
        let key = Self::profile_key(user, viewer.as_ref());
        let gateway = Arc::clone(&self.gateway);
        let user = user.clone();
        let value = swr(&self.cache, key, move || async move {
            build_profile_view(gateway, viewer, user).await
        })
        .await?;
        decode(&value)
    }
}

async fn build_profile_view(
    gateway: Arc<dyn RemoteGateway>,
    viewer: Option<EntityId>,
    user: EntityId,
) -> Result<Value> {
    let rows = gateway
        .select(
            Collection::Profiles,
            Query::filtered(Filter::new().eq("id", user.as_str())).limit(1),
        )
        .await?;
    let profile: Profile = match rows.into_iter().next() {
        Some(row) => decode(&row)?,
        None => return Err(AppError::NotFound),
    };

    let followers_count = gateway
        .count(
            Collection::Follows,
            Filter::new().eq("following_id", user.as_str()),
        )
        .await?;
    let following_count = gateway
        .count(
            Collection::Follows,
            Filter::new().eq("follower_id", user.as_str()),
        )
        .await?;

    let is_following = match &viewer {
        Some(viewer) if viewer != &user => {
            gateway
                .count(
                    Collection::Follows,
                    Filter::new()
                        .eq("follower_id", viewer.as_str())
                        .eq("following_id", user.as_str()),
                )
                .await?
                > 0
        }
        _ => false,
    };

    let view = ProfileView {
        profile,
        followers_count,
        following_count,
        is_following,
    };
    Ok(serde_json::to_value(view)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::gateway::memory::InMemoryGateway;
    use serde_json::json;

    fn fixture() -> (Arc<InMemoryGateway>, ProfileService) {
        let gateway = Arc::new(InMemoryGateway::new());
        let cache = Arc::new(EntityCache::new(&CacheConfig {
            default_ttl_seconds: 300,
            conversations_ttl_seconds: 120,
            messages_ttl_seconds: 60,
        }));
        let service = ProfileService::new(gateway.clone() as Arc<dyn RemoteGateway>, cache);
        (gateway, service)
    }

    #[tokio::test]
    async fn profile_view_carries_counts_and_follow_state() {
        let (gateway, service) = fixture();
        gateway.sign_in(EntityId("viewer".to_string()));
        gateway.seed(
            Collection::Profiles,
            vec![json!({"id": "u1", "username": "alice", "display_name": "Alice", "avatar_url": null, "bio": null, "created_at": "2026-01-01T00:00:00Z"})],
        );
        gateway.seed(
            Collection::Follows,
            vec![
                json!({"id": "f1", "follower_id": "viewer", "following_id": "u1", "created_at": "2026-01-02T00:00:00Z"}),
                json!({"id": "f2", "follower_id": "other", "following_id": "u1", "created_at": "2026-01-02T00:00:00Z"}),
                json!({"id": "f3", "follower_id": "u1", "following_id": "other", "created_at": "2026-01-02T00:00:00Z"}),
            ],
        );

        let view = service.profile(&EntityId("u1".to_string())).await.unwrap();
        assert_eq!(view.profile.username, "alice");
        assert_eq!(view.followers_count, 2);
        assert_eq!(view.following_count, 1);
        assert!(view.is_following);
    }

    #[tokio::test]
    async fn own_profile_never_reports_following() {
        let (gateway, service) = fixture();
        gateway.sign_in(EntityId("u1".to_string()));
        gateway.seed(
            Collection::Profiles,
            vec![json!({"id": "u1", "username": "alice", "display_name": null, "avatar_url": null, "bio": null, "created_at": "2026-01-01T00:00:00Z"})],
        );

        let view = service.profile(&EntityId("u1".to_string())).await.unwrap();
        assert!(!view.is_following);
    }

    #[tokio::test]
    async fn profile_views_never_leak_across_a_session_switch() {
        let (gateway, service) = fixture();
        gateway.seed(
            Collection::Profiles,
            vec![json!({"id": "u1", "username": "alice", "display_name": null, "avatar_url": null, "bio": null, "created_at": "2026-01-01T00:00:00Z"})],
        );
        gateway.seed(
            Collection::Follows,
            vec![json!({"id": "f1", "follower_id": "fan", "following_id": "u1", "created_at": "2026-01-02T00:00:00Z"})],
        );

        gateway.sign_in(EntityId("fan".to_string()));
        let view = service.profile(&EntityId("u1".to_string())).await.unwrap();
        assert!(view.is_following);

        // The cached view belongs to fan; a new session gets its own.
        gateway.sign_in(EntityId("stranger".to_string()));
        let view = service.profile(&EntityId("u1".to_string())).await.unwrap();
        assert!(!view.is_following);
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let (_gateway, service) = fixture();
        assert!(matches!(
            service.profile(&EntityId("absent".to_string())).await.unwrap_err(),
            AppError::NotFound
        ));
    }
}
