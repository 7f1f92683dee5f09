//! Feed reads
//!
//! Hydrates post records into [`PostView`]s: author profile, attached
//! images, like and comment counts, and the viewer's own like and
//! bookmark state. List views batch the companion lookups so a feed
//! of N posts costs a fixed number of gateway round trips.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{
    Collection, Comment, CommentView, EntityId, Post, PostImage, PostView, Profile,
};
use crate::error::{AppError, Result};
use crate::gateway::{Filter, Query, RemoteGateway};

use super::{decode, swr};

pub struct FeedService {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
}

impl FeedService {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: Arc<EntityCache>) -> Self {
        Self { gateway, cache }
    }

    /// Cache key for one viewer's hydrated view of a post
    ///
    /// The view carries per-viewer flags (`is_liked`, `is_bookmarked`),
    /// so the key embeds the viewer; a session switch never reads the
    /// previous viewer's flags.
    pub fn post_key(post: &EntityId, viewer: Option<&EntityId>) -> CacheKey {
        let viewer = viewer.map(EntityId::as_str).unwrap_or("anonymous");
        CacheKey::query(Collection::Posts, format!("post={};viewer={}", post, viewer))
    }

    fn viewer_label(&self) -> String {
        self.gateway
            .session()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// The home feed: all posts, newest first
    pub async fn feed(&self) -> Result<Vec<PostView>> {
        let key = CacheKey::query(
            Collection::Posts,
            format!("feed;viewer={}", self.viewer_label()),
        );
        let gateway = Arc::clone(&self.gateway);
        let viewer = self.gateway.session();
        let value = swr(&self.cache, key, move || async move {
            let query = Query::default().order_desc("created_at");
            build_post_views(gateway, viewer, query).await
        })
        .await?;
        decode(&value)
    }

    /// One post, hydrated for the detail screen
    pub async fn post(&self, post_id: &EntityId) -> Result<PostView> {
        let viewer = self.gateway.session();
        let key = Self::post_key(post_id, viewer.as_ref());
        let gateway = Arc::clone(&self.gateway);
        let post_id = post_id.clone();
        let value = swr(&self.cache, key, move || async move {
            let query = Query::filtered(Filter::new().eq("id", post_id.as_str()));
            let views: Vec<PostView> =
                decode(&build_post_views(gateway, viewer, query).await?)?;
            let view = views
                .into_iter()
                .next()
                .ok_or(AppError::NotFound)?;
            Ok(serde_json::to_value(view)?)
        })
        .await?;
        decode(&value)
    }

    /// Every post by one author, newest first
    pub async fn posts_by(&self, author: &EntityId) -> Result<Vec<PostView>> {
        let key = CacheKey::query(
            Collection::Posts,
            format!("author={};viewer={}", author, self.viewer_label()),
        );
        let gateway = Arc::clone(&self.gateway);
        let viewer = self.gateway.session();
        let author = author.clone();
        let value = swr(&self.cache, key, move || async move {
            let query = Query::filtered(Filter::new().eq("user_id", author.as_str()))
                .order_desc("created_at");
            build_post_views(gateway, viewer, query).await
        })
        .await?;
        decode(&value)
    }

    /// Comments under a post, oldest first
    pub async fn comments(&self, post_id: &EntityId) -> Result<Vec<CommentView>> {
        let key = CacheKey::query(Collection::Comments, format!("post={}", post_id));
        let gateway = Arc::clone(&self.gateway);
        let post_id = post_id.clone();
        let value = swr(&self.cache, key, move || async move {
            let rows = gateway
                .select(
                    Collection::Comments,
                    Query::filtered(Filter::new().eq("post_id", post_id.as_str()))
                        .order_asc("created_at"),
                )
                .await?;
            let comments: Vec<Comment> = decode(&Value::Array(rows))?;
            let authors = fetch_profiles(
                &gateway,
                comments.iter().map(|c| c.user_id.clone()).collect(),
            )
            .await?;
            let views: Vec<CommentView> = comments
                .into_iter()
                .map(|comment| {
                    let author = authors.get(comment.user_id.as_str()).cloned();
                    CommentView { comment, author }
                })
                .collect();
            Ok(serde_json::to_value(views)?)
        })
        .await?;
        decode(&value)
    }
}

/// Profiles for a set of user ids, keyed by id
pub(crate) async fn fetch_profiles(
    gateway: &Arc<dyn RemoteGateway>,
    user_ids: Vec<EntityId>,
) -> Result<HashMap<String, Profile>> {
    let ids: Vec<String> = user_ids
        .into_iter()
        .map(|id| id.as_str().to_string())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = gateway
        .select(
            Collection::Profiles,
            Query::filtered(Filter::new().is_in("id", ids)),
        )
        .await?;
    let profiles: Vec<Profile> = decode(&Value::Array(rows))?;
    Ok(profiles
        .into_iter()
        .map(|p| (p.id.as_str().to_string(), p))
        .collect())
}

/// Fetch and hydrate the posts a query selects
///
/// Companion lookups (profiles, images, likes, comments, bookmarks)
/// are batched with `in` filters over the selected post ids.
async fn build_post_views(
    gateway: Arc<dyn RemoteGateway>,
    viewer: Option<EntityId>,
    query: Query,
) -> Result<Value> {
    let rows = gateway.select(Collection::Posts, query).await?;
    let posts: Vec<Post> = decode(&Value::Array(rows))?;
    if posts.is_empty() {
        return Ok(serde_json::to_value(Vec::<PostView>::new())?);
    }

    let post_ids: Vec<String> = posts.iter().map(|p| p.id.as_str().to_string()).collect();

    // The companion lookups are independent; run them concurrently.
    let (authors, image_rows, like_rows, comment_rows) = futures::try_join!(
        fetch_profiles(&gateway, posts.iter().map(|p| p.user_id.clone()).collect()),
        async {
            Ok(gateway
                .select(
                    Collection::PostImages,
                    Query::filtered(Filter::new().is_in("post_id", post_ids.clone()))
                        .order_asc("created_at"),
                )
                .await?)
        },
        async {
            Ok(gateway
                .select(
                    Collection::Likes,
                    Query::filtered(Filter::new().is_in("post_id", post_ids.clone())),
                )
                .await?)
        },
        async {
            Ok(gateway
                .select(
                    Collection::Comments,
                    Query::filtered(Filter::new().is_in("post_id", post_ids.clone())),
                )
                .await?)
        },
    )?;

    let images: Vec<PostImage> = decode(&Value::Array(image_rows))?;
    let mut images_by_post: HashMap<String, Vec<PostImage>> = HashMap::new();
    for image in images {
        images_by_post
            .entry(image.post_id.as_str().to_string())
            .or_default()
            .push(image);
    }

    let mut likes_by_post: HashMap<String, u64> = HashMap::new();
    let mut liked_by_viewer: HashSet<String> = HashSet::new();
    for like in &like_rows {
        let post_id = like["post_id"].as_str().unwrap_or_default().to_string();
        *likes_by_post.entry(post_id.clone()).or_insert(0) += 1;
        if let (Some(viewer), Some(user_id)) = (&viewer, like["user_id"].as_str()) {
            if user_id == viewer.as_str() {
                liked_by_viewer.insert(post_id);
            }
        }
    }

    let mut comments_by_post: HashMap<String, u64> = HashMap::new();
    for comment in &comment_rows {
        let post_id = comment["post_id"].as_str().unwrap_or_default().to_string();
        *comments_by_post.entry(post_id).or_insert(0) += 1;
    }

    let mut bookmarked_by_viewer: HashSet<String> = HashSet::new();
    if let Some(viewer) = &viewer {
        let bookmark_rows = gateway
            .select(
                Collection::Bookmarks,
                Query::filtered(
                    Filter::new()
                        .eq("user_id", viewer.as_str())
                        .is_in("post_id", post_ids),
                ),
            )
            .await?;
        for bookmark in &bookmark_rows {
            if let Some(post_id) = bookmark["post_id"].as_str() {
                bookmarked_by_viewer.insert(post_id.to_string());
            }
        }
    }

    let views: Vec<PostView> = posts
        .into_iter()
        .map(|post| {
            let id = post.id.as_str().to_string();
            PostView {
                author: authors.get(post.user_id.as_str()).cloned(),
                images: images_by_post.remove(&id).unwrap_or_default(),
                likes_count: likes_by_post.get(&id).copied().unwrap_or(0),
                comments_count: comments_by_post.get(&id).copied().unwrap_or(0),
                is_liked: liked_by_viewer.contains(&id),
                is_bookmarked: bookmarked_by_viewer.contains(&id),
                post,
            }
        })
        .collect();

    Ok(serde_json::to_value(views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::gateway::memory::InMemoryGateway;
    use serde_json::json;

    fn fixture() -> (Arc<InMemoryGateway>, FeedService) {
        let gateway = Arc::new(InMemoryGateway::new());
        let cache = Arc::new(EntityCache::new(&CacheConfig {
            default_ttl_seconds: 300,
            conversations_ttl_seconds: 120,
            messages_ttl_seconds: 60,
        }));
        let service = FeedService::new(gateway.clone() as Arc<dyn RemoteGateway>, cache);
        (gateway, service)
    }

    fn seed_profile(gateway: &InMemoryGateway, id: &str, username: &str) {
        gateway.seed(
            Collection::Profiles,
            vec![json!({
                "id": id,
                "username": username,
                "display_name": null,
                "avatar_url": null,
                "bio": null,
                "created_at": "2026-01-01T00:00:00Z",
            })],
        );
    }

    fn seed_post(gateway: &InMemoryGateway, id: &str, user: &str, at: &str) {
        gateway.seed(
            Collection::Posts,
            vec![json!({
                "id": id,
                "user_id": user,
                "content": "hello",
                "created_at": at,
            })],
        );
    }

    #[tokio::test]
    async fn feed_orders_newest_first_and_hydrates_counts() {
        let (gateway, service) = fixture();
        gateway.sign_in(EntityId("viewer".to_string()));
        seed_profile(&gateway, "u1", "alice");
        seed_profile(&gateway, "viewer", "bob");
        seed_post(&gateway, "p1", "u1", "2026-01-01T00:00:00Z");
        seed_post(&gateway, "p2", "u1", "2026-01-02T00:00:00Z");
        gateway.seed(
            Collection::Likes,
            vec![
                json!({"id": "l1", "post_id": "p1", "user_id": "viewer", "created_at": "2026-01-03T00:00:00Z"}),
                json!({"id": "l2", "post_id": "p1", "user_id": "u1", "created_at": "2026-01-03T00:00:00Z"}),
            ],
        );
        gateway.seed(
            Collection::Comments,
            vec![json!({"id": "c1", "post_id": "p2", "user_id": "u1", "content": "first", "created_at": "2026-01-03T00:00:00Z"})],
        );

        let feed = service.feed().await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].post.id.as_str(), "p2");
        assert_eq!(feed[0].comments_count, 1);
        assert_eq!(feed[1].post.id.as_str(), "p1");
        assert_eq!(feed[1].likes_count, 2);
        assert!(feed[1].is_liked);
        assert_eq!(feed[1].author.as_ref().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn gateway_failures_surface_as_network_errors() {
        use crate::gateway::{GatewayError, MockRemoteGateway};

        let mut gateway = MockRemoteGateway::new();
        gateway.expect_session().return_const(None::<EntityId>);
        gateway
            .expect_select()
            .returning(|_, _| Err(GatewayError::Unreachable("offline".to_string())));

        let cache = Arc::new(EntityCache::new(&CacheConfig {
            default_ttl_seconds: 300,
            conversations_ttl_seconds: 120,
            messages_ttl_seconds: 60,
        }));
        let service = FeedService::new(Arc::new(gateway), cache);

        assert!(matches!(
            service.feed().await.unwrap_err(),
            AppError::Network(_)
        ));
    }

    #[tokio::test]
    async fn post_views_never_leak_across_a_session_switch() {
        let (gateway, service) = fixture();
        seed_profile(&gateway, "author", "alice");
        seed_post(&gateway, "p1", "author", "2026-01-01T00:00:00Z");
        gateway.seed(
            Collection::Likes,
            vec![json!({"id": "l1", "post_id": "p1", "user_id": "u1", "created_at": "2026-01-02T00:00:00Z"})],
        );

        gateway.sign_in(EntityId("u1".to_string()));
        let view = service.post(&EntityId("p1".to_string())).await.unwrap();
        assert!(view.is_liked);

        // The cached view belongs to u1; u2 gets their own.
        gateway.sign_in(EntityId("u2".to_string()));
        let view = service.post(&EntityId("p1".to_string())).await.unwrap();
        assert!(!view.is_liked);
    }

    #[tokio::test]
    async fn missing_post_is_not_found() {
        let (_gateway, service) = fixture();
        let err = service.post(&EntityId("absent".to_string())).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn comments_come_back_oldest_first_with_authors() {
        let (gateway, service) = fixture();
        seed_profile(&gateway, "u1", "alice");
        gateway.seed(
            Collection::Comments,
            vec![
                json!({"id": "c2", "post_id": "p1", "user_id": "u1", "content": "second", "created_at": "2026-01-02T00:00:00Z"}),
                json!({"id": "c1", "post_id": "p1", "user_id": "u1", "content": "first", "created_at": "2026-01-01T00:00:00Z"}),
            ],
        );

        let comments = service.comments(&EntityId("p1".to_string())).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].comment.content, "first");
        assert_eq!(comments[1].comment.content, "second");
        assert_eq!(comments[0].author.as_ref().unwrap().username, "alice");
    }
}
