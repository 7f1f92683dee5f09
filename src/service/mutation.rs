//! Mutation coordinator
//!
//! Single write path for the synchronization core. Interaction writes
//! (like, bookmark, follow, message) run optimistically: snapshot the
//! cached view, flip it, then perform the remote write. Success
//! commits by invalidating the affected cache entries so the next
//! read re-pulls authoritative state; failure restores the snapshot
//! and emits exactly one user-facing notice.
//!
//! Mutations against the same entity serialize on a per-entity lock,
//! so rapid toggles settle in order instead of racing each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::{GatewayConfig, LimitsConfig};
use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{
    Collection, Comment, EntityId, Message, MessageView, Post, PostView, Profile,
};
use crate::error::{AppError, Notice, Result};
use crate::gateway::{Filter, GatewayError, Query, RemoteGateway};
use crate::metrics::{MUTATIONS_TOTAL, ROLLBACKS_TOTAL};
use crate::service::chat::ChatService;
use crate::service::feed::FeedService;
use crate::service::profile::ProfileService;

use super::{decode, require_session};

/// Lifecycle of one optimistic mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Pending,
    Committed,
    RolledBack,
}

/// An image attachment staged for upload
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Partial profile edit; `None` fields are left untouched
#[derive(Default)]
pub struct ProfileChanges {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<ImageUpload>,
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

pub struct MutationCoordinator {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
    chat: Arc<ChatService>,
    limits: LimitsConfig,
    post_images_bucket: String,
    avatars_bucket: String,
    notices: broadcast::Sender<Notice>,
    /// One lock per (mutation kind, entity); serializes rapid toggles
    locks: parking_lot::Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl MutationCoordinator {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        cache: Arc<EntityCache>,
        chat: Arc<ChatService>,
        gateway_config: &GatewayConfig,
        limits: LimitsConfig,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            gateway,
            cache,
            chat,
            limits,
            post_images_bucket: gateway_config.post_images_bucket.clone(),
            avatars_bucket: gateway_config.avatars_bucket.clone(),
            notices,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Listen for user-facing notices emitted by failed mutations
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    async fn entity_lock(
        &self,
        kind: &str,
        entity: &EntityId,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // An entry held only by the map is idle; drop it so the
            // map stays bounded by the number of in-flight mutations.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((kind.to_string(), entity.as_str().to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }

    /// Record the outcome and emit the single failure notice
    fn settle<T>(&self, mutation: &'static str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                tracing::debug!(mutation, phase = ?MutationPhase::Committed, "mutation committed");
                MUTATIONS_TOTAL
                    .with_label_values(&[mutation, "committed"])
                    .inc();
            }
            Err(error) => {
                tracing::warn!(mutation, %error, "mutation failed");
                MUTATIONS_TOTAL.with_label_values(&[mutation, "failed"]).inc();
                let _ = self.notices.send(error.to_notice());
            }
        }
        result
    }

    /// Apply an optimistic flip to a cached view, returning the
    /// snapshot needed to undo it. `None` when nothing is cached.
    async fn flip_cached(
        &self,
        key: &CacheKey,
        flip: impl FnOnce(&mut Value),
    ) -> Option<Arc<Value>> {
        let snapshot = self.cache.peek(key).await?;
        let mut updated = snapshot.as_ref().clone();
        flip(&mut updated);
        self.cache.put(key.clone(), updated).await;
        tracing::debug!(?key, phase = ?MutationPhase::Pending, "optimistic flip applied");
        Some(snapshot)
    }

    /// Undo an optimistic flip after a failed remote write
    async fn rollback(&self, mutation: &'static str, key: &CacheKey, snapshot: Option<Arc<Value>>) {
        match snapshot {
            Some(snapshot) => self.cache.restore(key.clone(), snapshot).await,
            None => self.cache.invalidate(key).await,
        }
        tracing::debug!(?key, phase = ?MutationPhase::RolledBack, "optimistic flip rolled back");
        ROLLBACKS_TOTAL.with_label_values(&[mutation]).inc();
    }

    /// Post author, from the cached view when available
    ///
    /// Notification fan-out for likes, comments and follows happens
    /// in backend triggers, never here.
    async fn post_author(&self, post: &EntityId) -> Result<EntityId> {
        let key = FeedService::post_key(post, self.gateway.session().as_ref());
        if let Some(cached) = self.cache.peek(&key).await {
            if let Ok(view) = decode::<PostView>(&cached) {
                return Ok(view.post.user_id);
            }
        }
        let rows = self
            .gateway
            .select(
                Collection::Posts,
                Query::filtered(Filter::new().eq("id", post.as_str())).limit(1),
            )
            .await?;
        let record: Post = match rows.into_iter().next() {
            Some(row) => decode(&row)?,
            None => return Err(AppError::NotFound),
        };
        Ok(record.user_id)
    }

    // =========================================================================
    // Likes and bookmarks
    // =========================================================================

    /// Toggle the viewer's like on a post
    pub async fn toggle_like(&self, post: &EntityId) -> Result<bool> {
        let result = self.toggle_like_inner(post).await;
        self.settle("like", result)
    }

    async fn toggle_like_inner(&self, post: &EntityId) -> Result<bool> {
        let viewer = require_session(&self.gateway)?;
        let _guard = self.entity_lock("like", post).await;

        let liked = self.marker_state(Collection::Likes, &viewer, post).await?;
        let key = FeedService::post_key(post, Some(&viewer));
        let snapshot = self
            .flip_cached(&key, |view| {
                view["is_liked"] = json!(!liked);
                let count = view["likes_count"].as_u64().unwrap_or(0);
                view["likes_count"] = json!(if liked { count.saturating_sub(1) } else { count + 1 });
            })
            .await;

        let outcome = self
            .write_marker(Collection::Likes, &viewer, post, !liked)
            .await;
        if let Err(error) = outcome {
            self.rollback("like", &key, snapshot).await;
            return Err(error);
        }

        self.cache.invalidate_collection(Collection::Posts);
        Ok(!liked)
    }

    /// Toggle the viewer's bookmark on a post
    pub async fn toggle_bookmark(&self, post: &EntityId) -> Result<bool> {
        let result = self.toggle_bookmark_inner(post).await;
        self.settle("bookmark", result)
    }

    async fn toggle_bookmark_inner(&self, post: &EntityId) -> Result<bool> {
        let viewer = require_session(&self.gateway)?;
        let _guard = self.entity_lock("bookmark", post).await;

        let bookmarked = self
            .marker_state(Collection::Bookmarks, &viewer, post)
            .await?;
        let key = FeedService::post_key(post, Some(&viewer));
        let snapshot = self
            .flip_cached(&key, |view| {
                view["is_bookmarked"] = json!(!bookmarked);
            })
            .await;

        let outcome = self
            .write_marker(Collection::Bookmarks, &viewer, post, !bookmarked)
            .await;
        if let Err(error) = outcome {
            self.rollback("bookmark", &key, snapshot).await;
            return Err(error);
        }

        self.cache.invalidate_collection(Collection::Posts);
        Ok(!bookmarked)
    }

    /// Whether the viewer's marker row (like or bookmark) exists
    ///
    /// Prefers the cached view; falls back to a backend count.
    async fn marker_state(
        &self,
        collection: Collection,
        viewer: &EntityId,
        post: &EntityId,
    ) -> Result<bool> {
        let key = FeedService::post_key(post, Some(viewer));
        if let Some(cached) = self.cache.peek(&key).await {
            let field = match collection {
                Collection::Likes => "is_liked",
                _ => "is_bookmarked",
            };
            if let Some(state) = cached.get(field).and_then(Value::as_bool) {
                return Ok(state);
            }
        }
        let count = self
            .gateway
            .count(
                collection,
                Filter::new()
                    .eq("user_id", viewer.as_str())
                    .eq("post_id", post.as_str()),
            )
            .await?;
        Ok(count > 0)
    }

    /// Insert or delete the marker row
    ///
    /// A conflict on insert means the remote row appeared behind our
    /// back; it fails the mutation so the optimistic flip rolls back
    /// and the next read converges on the remote state.
    async fn write_marker(
        &self,
        collection: Collection,
        viewer: &EntityId,
        post: &EntityId,
        present: bool,
    ) -> Result<()> {
        if present {
            let record = json!({
                "user_id": viewer.as_str(),
                "post_id": post.as_str(),
            });
            self.gateway.insert(collection, record).await?;
            Ok(())
        } else {
            self.gateway
                .delete(
                    collection,
                    Filter::new()
                        .eq("user_id", viewer.as_str())
                        .eq("post_id", post.as_str()),
                )
                .await?;
            Ok(())
        }
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Toggle the viewer following another user
    pub async fn toggle_follow(&self, target: &EntityId) -> Result<bool> {
        let result = self.toggle_follow_inner(target).await;
        self.settle("follow", result)
    }

    async fn toggle_follow_inner(&self, target: &EntityId) -> Result<bool> {
        let viewer = require_session(&self.gateway)?;
        if &viewer == target {
            return Err(AppError::Validation(
                "You cannot follow yourself".to_string(),
            ));
        }
        let _guard = self.entity_lock("follow", target).await;

        let key = ProfileService::profile_key(target, Some(&viewer));
        let following = match self.cache.peek(&key).await {
            Some(cached) => cached
                .get("is_following")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            None => {
                self.gateway
                    .count(
                        Collection::Follows,
                        Filter::new()
                            .eq("follower_id", viewer.as_str())
                            .eq("following_id", target.as_str()),
                    )
                    .await?
                    > 0
            }
        };

        let snapshot = self
            .flip_cached(&key, |view| {
                view["is_following"] = json!(!following);
                let count = view["followers_count"].as_u64().unwrap_or(0);
                view["followers_count"] =
                    json!(if following { count.saturating_sub(1) } else { count + 1 });
            })
            .await;

        let outcome = if !following {
            let record = json!({
                "follower_id": viewer.as_str(),
                "following_id": target.as_str(),
            });
            self.gateway
                .insert(Collection::Follows, record)
                .await
                .map(|_| ())
                .map_err(AppError::from)
        } else {
            self.gateway
                .delete(
                    Collection::Follows,
                    Filter::new()
                        .eq("follower_id", viewer.as_str())
                        .eq("following_id", target.as_str()),
                )
                .await
                .map_err(AppError::from)
        };
        if let Err(error) = outcome {
            self.rollback("follow", &key, snapshot).await;
            return Err(error);
        }

        self.cache.invalidate(&key).await;
        Ok(!following)
    }

    // =========================================================================
    // Posts and comments
    // =========================================================================

    /// Create a post, uploading any attached images first
    ///
    /// All uploads must succeed before the post row is inserted; a
    /// failed upload aborts the whole mutation and leaves no post
    /// behind.
    pub async fn create_post(&self, content: &str, images: Vec<ImageUpload>) -> Result<Post> {
        let result = self.create_post_inner(content, images).await;
        self.settle("create_post", result)
    }

    async fn create_post_inner(&self, content: &str, images: Vec<ImageUpload>) -> Result<Post> {
        let viewer = require_session(&self.gateway)?;

        let trimmed = content.trim();
        if trimmed.is_empty() && images.is_empty() {
            return Err(AppError::Validation("Post cannot be empty".to_string()));
        }
        if images.len() > self.limits.max_post_images {
            return Err(AppError::Validation(format!(
                "You can attach up to {} images",
                self.limits.max_post_images
            )));
        }
        for image in &images {
            if image.bytes.len() > self.limits.max_image_bytes {
                return Err(AppError::Validation(
                    "Images must be 5 MB or smaller".to_string(),
                ));
            }
            if image_extension(&image.content_type).is_none() {
                return Err(AppError::Validation(
                    "Unsupported image type".to_string(),
                ));
            }
        }

        let mut image_urls = Vec::with_capacity(images.len());
        for image in &images {
            let ext = image_extension(&image.content_type).unwrap_or("bin");
            let path = format!("{}/{}.{}", viewer, EntityId::new(), ext);
            self.gateway
                .upload(
                    &self.post_images_bucket,
                    &path,
                    image.bytes.clone(),
                    &image.content_type,
                )
                .await?;
            image_urls.push(self.gateway.public_url(&self.post_images_bucket, &path));
        }

        // An image-only post stores a single space, never an empty string.
        let stored = if trimmed.is_empty() { " " } else { trimmed };
        let row = self
            .gateway
            .insert(
                Collection::Posts,
                json!({
                    "user_id": viewer.as_str(),
                    "content": stored,
                }),
            )
            .await?;
        let post: Post = decode(&row)?;

        for url in image_urls {
            self.gateway
                .insert(
                    Collection::PostImages,
                    json!({
                        "post_id": post.id.as_str(),
                        "image_url": url,
                    }),
                )
                .await?;
        }

        self.cache.invalidate_collection(Collection::Posts);
        Ok(post)
    }

    /// Delete one of the viewer's own posts
    pub async fn delete_post(&self, post: &EntityId) -> Result<()> {
        let result = self.delete_post_inner(post).await;
        self.settle("delete_post", result)
    }

    async fn delete_post_inner(&self, post: &EntityId) -> Result<()> {
        let viewer = require_session(&self.gateway)?;
        let author = self.post_author(post).await?;
        if author != viewer {
            return Err(AppError::Unauthorized);
        }
        self.gateway
            .delete(Collection::Posts, Filter::new().eq("id", post.as_str()))
            .await?;
        self.cache.invalidate_collection(Collection::Posts);
        Ok(())
    }

    /// Comment on a post
    pub async fn create_comment(&self, post: &EntityId, content: &str) -> Result<Comment> {
        let result = self.create_comment_inner(post, content).await;
        self.settle("create_comment", result)
    }

    async fn create_comment_inner(&self, post: &EntityId, content: &str) -> Result<Comment> {
        let viewer = require_session(&self.gateway)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Comment cannot be empty".to_string()));
        }

        let row = self
            .gateway
            .insert(
                Collection::Comments,
                json!({
                    "post_id": post.as_str(),
                    "user_id": viewer.as_str(),
                    "content": trimmed,
                }),
            )
            .await?;
        let comment: Comment = decode(&row)?;

        self.cache
            .invalidate(&CacheKey::query(
                Collection::Comments,
                format!("post={}", post),
            ))
            .await;
        self.cache.invalidate_collection(Collection::Posts);
        Ok(comment)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a direct message, creating the conversation if needed
    pub async fn send_message(&self, partner: &EntityId, content: &str) -> Result<Message> {
        let result = self.send_message_inner(partner, content).await;
        self.settle("send_message", result)
    }

    async fn send_message_inner(&self, partner: &EntityId, content: &str) -> Result<Message> {
        let viewer = require_session(&self.gateway)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        let _guard = self.entity_lock("message", partner).await;

        let conversation = self.chat.ensure_conversation(&viewer, partner).await?;
        let now = Utc::now();

        // Optimistically append to the open thread, if it is cached.
        let key = ChatService::messages_key(&conversation.id);
        let optimistic = MessageView {
            message: Message {
                id: EntityId::new(),
                conversation_id: conversation.id.clone(),
                sender_id: viewer.clone(),
                receiver_id: partner.clone(),
                content: trimmed.to_string(),
                is_read: false,
                created_at: now,
            },
            sender: None,
        };
        let appended = serde_json::to_value(&optimistic)?;
        let snapshot = self
            .flip_cached(&key, |thread| {
                if let Some(messages) = thread.as_array_mut() {
                    messages.push(appended);
                }
            })
            .await;

        let outcome = self.write_message(&conversation.id, &viewer, partner, trimmed, now).await;
        let message = match outcome {
            Ok(message) => message,
            Err(error) => {
                self.rollback("send_message", &key, snapshot).await;
                return Err(error);
            }
        };

        self.cache.invalidate(&key).await;
        self.cache.invalidate_collection(Collection::Conversations);
        Ok(message)
    }

    async fn write_message(
        &self,
        conversation: &EntityId,
        viewer: &EntityId,
        partner: &EntityId,
        content: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<Message> {
        let row = self
            .gateway
            .insert(
                Collection::Messages,
                json!({
                    "conversation_id": conversation.as_str(),
                    "sender_id": viewer.as_str(),
                    "receiver_id": partner.as_str(),
                    "content": content,
                    "is_read": false,
                }),
            )
            .await?;
        let message: Message = decode(&row)?;

        self.gateway
            .update(
                Collection::Conversations,
                Filter::new().eq("id", conversation.as_str()),
                json!({"last_message_at": now.to_rfc3339()}),
            )
            .await?;
        Ok(message)
    }

    // =========================================================================
    // Profile edits
    // =========================================================================

    /// Edit the viewer's profile
    pub async fn update_profile(&self, changes: ProfileChanges) -> Result<Profile> {
        let result = self.update_profile_inner(changes).await;
        self.settle("update_profile", result)
    }

    async fn update_profile_inner(&self, changes: ProfileChanges) -> Result<Profile> {
        let viewer = require_session(&self.gateway)?;

        let mut patch = serde_json::Map::new();
        if let Some(username) = &changes.username {
            validate_username(username)?;
            patch.insert("username".to_string(), json!(username));
        }
        if let Some(display_name) = &changes.display_name {
            if display_name.chars().count() > self.limits.max_display_name_chars {
                return Err(AppError::Validation(format!(
                    "Display name must be {} characters or fewer",
                    self.limits.max_display_name_chars
                )));
            }
            patch.insert("display_name".to_string(), json!(display_name));
        }
        if let Some(bio) = &changes.bio {
            if bio.chars().count() > self.limits.max_bio_chars {
                return Err(AppError::Validation(format!(
                    "Bio must be {} characters or fewer",
                    self.limits.max_bio_chars
                )));
            }
            patch.insert("bio".to_string(), json!(bio));
        }
        if let Some(avatar) = &changes.avatar {
            if avatar.bytes.len() > self.limits.max_image_bytes {
                return Err(AppError::Validation(
                    "Images must be 5 MB or smaller".to_string(),
                ));
            }
            let ext = image_extension(&avatar.content_type).ok_or_else(|| {
                AppError::Validation("Unsupported image type".to_string())
            })?;
            let path = format!("{}/avatar-{}.{}", viewer, EntityId::new(), ext);
            self.gateway
                .upload(
                    &self.avatars_bucket,
                    &path,
                    avatar.bytes.clone(),
                    &avatar.content_type,
                )
                .await?;
            patch.insert(
                "avatar_url".to_string(),
                json!(self.gateway.public_url(&self.avatars_bucket, &path)),
            );
        }
        if patch.is_empty() {
            return Err(AppError::Validation("Nothing to update".to_string()));
        }

        let rows = self
            .gateway
            .update(
                Collection::Profiles,
                Filter::new().eq("id", viewer.as_str()),
                Value::Object(patch),
            )
            .await
            .map_err(|e| match e {
                GatewayError::Conflict(_) => {
                    AppError::Conflict("Username is already taken".to_string())
                }
                other => other.into(),
            })?;
        let profile: Profile = match rows.into_iter().next() {
            Some(row) => decode(&row)?,
            None => return Err(AppError::NotFound),
        };

        self.cache.invalidate_collection(Collection::Profiles);
        Ok(profile)
    }
}

fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !(3..=20).contains(&len) || !valid_chars {
        return Err(AppError::Validation(
            "Username must be 3-20 characters using letters, numbers and underscores".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::data::models::PostImage;
    use crate::gateway::memory::InMemoryGateway;

    struct Fixture {
        gateway: Arc<InMemoryGateway>,
        cache: Arc<EntityCache>,
        coordinator: MutationCoordinator,
        notices: broadcast::Receiver<Notice>,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(InMemoryGateway::new());
        let cache = Arc::new(EntityCache::new(&CacheConfig {
            default_ttl_seconds: 300,
            conversations_ttl_seconds: 120,
            messages_ttl_seconds: 60,
        }));
        let chat = Arc::new(ChatService::new(
            gateway.clone() as Arc<dyn RemoteGateway>,
            Arc::clone(&cache),
        ));
        let (notices_tx, notices) = broadcast::channel(16);
        let gateway_config = GatewayConfig {
            base_url: "memory://".to_string(),
            api_key: "test".to_string(),
            post_images_bucket: "post-images".to_string(),
            avatars_bucket: "avatars".to_string(),
            request_timeout_seconds: 10,
        };
        let coordinator = MutationCoordinator::new(
            gateway.clone() as Arc<dyn RemoteGateway>,
            Arc::clone(&cache),
            chat,
            &gateway_config,
            LimitsConfig {
                max_post_images: 4,
                max_image_bytes: 5 * 1024 * 1024,
                max_bio_chars: 160,
                max_display_name_chars: 50,
            },
            notices_tx,
        );
        gateway.sign_in(EntityId("viewer".to_string()));
        Fixture {
            gateway,
            cache,
            coordinator,
            notices,
        }
    }

    fn seed_post(gateway: &InMemoryGateway, id: &str, author: &str) {
        gateway.seed(
            Collection::Posts,
            vec![json!({
                "id": id,
                "user_id": author,
                "content": "hello",
                "created_at": "2026-01-01T00:00:00Z",
            })],
        );
    }

    fn cached_post_view(id: &str, author: &str, liked: bool, likes: u64) -> Value {
        serde_json::to_value(PostView {
            post: Post {
                id: EntityId(id.to_string()),
                user_id: EntityId(author.to_string()),
                content: "hello".to_string(),
                created_at: Utc::now(),
            },
            author: None,
            images: Vec::<PostImage>::new(),
            likes_count: likes,
            comments_count: 0,
            is_liked: liked,
            is_bookmarked: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn toggle_like_inserts_then_removes_the_row() {
        let f = fixture();
        seed_post(&f.gateway, "p1", "author");
        let post = EntityId("p1".to_string());

        assert!(f.coordinator.toggle_like(&post).await.unwrap());
        assert_eq!(f.gateway.rows(Collection::Likes).len(), 1);

        assert!(!f.coordinator.toggle_like(&post).await.unwrap());
        assert!(f.gateway.rows(Collection::Likes).is_empty());
    }

    #[tokio::test]
    async fn like_notifies_the_author_but_never_the_actor() {
        let f = fixture();
        seed_post(&f.gateway, "p1", "author");
        seed_post(&f.gateway, "p2", "viewer");

        f.coordinator
            .toggle_like(&EntityId("p1".to_string()))
            .await
            .unwrap();
        f.coordinator
            .toggle_like(&EntityId("p2".to_string()))
            .await
            .unwrap();

        let notifications = f.gateway.rows(Collection::Notifications);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["user_id"], "author");
        assert_eq!(notifications[0]["type"], "like");
    }

    #[tokio::test]
    async fn failed_like_rolls_back_the_cached_view_and_emits_one_notice() {
        let mut f = fixture();
        seed_post(&f.gateway, "p1", "author");
        let post = EntityId("p1".to_string());
        let key = FeedService::post_key(&post, Some(&EntityId("viewer".to_string())));
        f.cache
            .put(key.clone(), cached_post_view("p1", "author", false, 3))
            .await;

        f.gateway
            .fail_next(GatewayError::Unreachable("down".to_string()));
        let err = f.coordinator.toggle_like(&post).await.unwrap_err();
        assert!(matches!(err, AppError::Network(_)));

        let restored = f.cache.peek(&key).await.unwrap();
        assert_eq!(restored["is_liked"], false);
        assert_eq!(restored["likes_count"], 3);
        assert!(f.gateway.rows(Collection::Likes).is_empty());

        let notice = f.notices.try_recv().unwrap();
        assert!(notice.message.contains("connection"));
        assert!(f.notices.try_recv().is_err(), "exactly one notice");
    }

    #[tokio::test]
    async fn duplicate_like_conflict_rolls_back_and_notices_once() {
        let mut f = fixture();
        seed_post(&f.gateway, "p1", "author");
        // Cached view says not liked, but the remote row appears
        // between read and write.
        let post = EntityId("p1".to_string());
        let key = FeedService::post_key(&post, Some(&EntityId("viewer".to_string())));
        f.cache
            .put(key.clone(), cached_post_view("p1", "author", false, 5))
            .await;
        f.gateway
            .fail_next(GatewayError::Conflict("duplicate key".to_string()));

        let err = f.coordinator.toggle_like(&post).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let restored = f.cache.peek(&key).await.unwrap();
        assert_eq!(restored["is_liked"], false);
        assert_eq!(restored["likes_count"], 5);

        assert!(f.notices.try_recv().is_ok());
        assert!(f.notices.try_recv().is_err(), "exactly one notice");
    }

    #[tokio::test]
    async fn create_post_uploads_images_before_the_insert() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post(
                "  ",
                vec![ImageUpload {
                    bytes: vec![1, 2, 3],
                    content_type: "image/png".to_string(),
                }],
            )
            .await
            .unwrap();

        // Image-only posts store a single space.
        assert_eq!(post.content, " ");
        let images = f.gateway.rows(Collection::PostImages);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["post_id"], post.id.as_str());
        assert!(images[0]["image_url"]
            .as_str()
            .unwrap()
            .contains("post-images"));
    }

    #[tokio::test]
    async fn create_post_rejects_empty_and_over_limit() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.create_post("   ", vec![]).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let images = (0..5)
            .map(|_| ImageUpload {
                bytes: vec![0],
                content_type: "image/png".to_string(),
            })
            .collect();
        assert!(matches!(
            f.coordinator.create_post("hi", images).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(f.gateway.rows(Collection::Posts).is_empty());
    }

    #[tokio::test]
    async fn failed_upload_aborts_the_whole_post() {
        let f = fixture();
        f.gateway
            .fail_next(GatewayError::Unreachable("storage down".to_string()));
        let err = f
            .coordinator
            .create_post(
                "hello",
                vec![ImageUpload {
                    bytes: vec![1],
                    content_type: "image/jpeg".to_string(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
        assert!(f.gateway.rows(Collection::Posts).is_empty());
    }

    #[tokio::test]
    async fn only_the_author_can_delete_a_post() {
        let f = fixture();
        seed_post(&f.gateway, "p1", "someone_else");
        let err = f
            .coordinator
            .delete_post(&EntityId("p1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
        assert_eq!(f.gateway.rows(Collection::Posts).len(), 1);
    }

    #[tokio::test]
    async fn send_message_creates_the_conversation_and_bumps_activity() {
        let f = fixture();
        let partner = EntityId("partner".to_string());

        let message = f.coordinator.send_message(&partner, "hi there").await.unwrap();
        assert_eq!(message.content, "hi there");
        assert!(!message.is_read);

        let conversations = f.gateway.rows(Collection::Conversations);
        assert_eq!(conversations.len(), 1);
        assert_eq!(
            conversations[0]["id"].as_str().unwrap(),
            message.conversation_id.as_str()
        );

        // Second message reuses the conversation.
        f.coordinator.send_message(&partner, "again").await.unwrap();
        assert_eq!(f.gateway.rows(Collection::Conversations).len(), 1);
        assert_eq!(f.gateway.rows(Collection::Messages).len(), 2);
    }

    #[tokio::test]
    async fn failed_send_restores_the_cached_thread() {
        let mut f = fixture();
        let partner = EntityId("partner".to_string());
        let conversation = f
            .coordinator
            .chat
            .ensure_conversation(&EntityId("viewer".to_string()), &partner)
            .await
            .unwrap();
        let key = ChatService::messages_key(&conversation.id);
        f.cache.put(key.clone(), json!([])).await;

        f.gateway
            .fail_next(GatewayError::Unreachable("down".to_string()));
        f.coordinator
            .send_message(&partner, "lost")
            .await
            .unwrap_err();

        let thread = f.cache.peek(&key).await.unwrap();
        assert_eq!(thread.as_array().unwrap().len(), 0, "optimistic append undone");
        assert!(f.notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn username_conflicts_surface_a_friendly_message() {
        let f = fixture();
        f.gateway.seed(
            Collection::Profiles,
            vec![
                json!({"id": "viewer", "username": "old_name", "display_name": null, "avatar_url": null, "bio": null, "created_at": "2026-01-01T00:00:00Z"}),
            ],
        );
        f.gateway
            .fail_next(GatewayError::Conflict("duplicate key".to_string()));

        let err = f
            .coordinator
            .update_profile(ProfileChanges {
                username: Some("taken_name".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        match err {
            AppError::Conflict(message) => assert_eq!(message, "Username is already taken"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn profile_validation_enforces_username_and_bio_limits() {
        let f = fixture();
        for username in ["ab", "way_too_long_username_here", "bad name!"] {
            let err = f
                .coordinator
                .update_profile(ProfileChanges {
                    username: Some(username.to_string()),
                    ..Default::default()
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{}", username);
        }

        let err = f
            .coordinator
            .update_profile(ProfileChanges {
                bio: Some("x".repeat(161)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn rapid_toggles_serialize_to_a_consistent_end_state() {
        let f = fixture();
        seed_post(&f.gateway, "p1", "author");
        let coordinator = Arc::new(f.coordinator);
        let post = EntityId("p1".to_string());

        let a = {
            let coordinator = Arc::clone(&coordinator);
            let post = post.clone();
            tokio::spawn(async move { coordinator.toggle_like(&post).await })
        };
        let b = {
            let coordinator = Arc::clone(&coordinator);
            let post = post.clone();
            tokio::spawn(async move { coordinator.toggle_like(&post).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Two toggles from the same unliked start cancel out.
        assert!(f.gateway.rows(Collection::Likes).is_empty());
    }

    #[tokio::test]
    async fn idle_entity_locks_are_pruned() {
        let f = fixture();
        seed_post(&f.gateway, "p1", "author");
        seed_post(&f.gateway, "p2", "author");
        for id in ["p1", "p2"] {
            f.coordinator
                .toggle_like(&EntityId(id.to_string()))
                .await
                .unwrap();
        }

        // Acquiring a fresh lock sweeps the idle ones out.
        let _guard = f
            .coordinator
            .entity_lock("like", &EntityId("p3".to_string()))
            .await;
        assert_eq!(f.coordinator.locks.lock().len(), 1);
    }
}
