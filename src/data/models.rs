//! Data models
//!
//! Rust structs representing remote records and hydrated view items.
//! All models use ULID for IDs and chrono for timestamps. Records
//! cross the gateway boundary as JSON and deserialize into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Collections
// =============================================================================

/// Named record collections exposed by the remote gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Profiles,
    Posts,
    PostImages,
    Comments,
    Likes,
    Bookmarks,
    Follows,
    Conversations,
    Messages,
    Notifications,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Posts => "posts",
            Self::PostImages => "post_images",
            Self::Comments => "comments",
            Self::Likes => "likes",
            Self::Bookmarks => "bookmarks",
            Self::Follows => "follows",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::Notifications => "notifications",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Profile
// =============================================================================

/// A user profile
///
/// Owned by the user it represents; mutated only through profile-edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: EntityId,
    /// Unique handle used for @mentions
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Posts
// =============================================================================

/// A post as stored remotely
///
/// Counts and per-viewer flags are never stored on the record;
/// see [`PostView`] for the hydrated form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: EntityId,
    /// Author profile reference
    pub user_id: EntityId,
    /// Plain text; whitespace-only is allowed when images are attached
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Image attached to a post (0..4 per post, ordered by creation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostImage {
    pub id: EntityId,
    pub post_id: EntityId,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

/// A comment on a post
///
/// Append-only from the client's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: EntityId,
    pub post_id: EntityId,
    pub user_id: EntityId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Like relationship (at most one per user/post pair, enforced remotely)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Like {
    pub id: EntityId,
    pub post_id: EntityId,
    pub user_id: EntityId,
    pub created_at: DateTime<Utc>,
}

/// Bookmark relationship (at most one per user/post pair, enforced remotely)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: EntityId,
    pub post_id: EntityId,
    pub user_id: EntityId,
    pub created_at: DateTime<Utc>,
}

/// Follow relationship (asymmetric; mutual follows are a normal state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follow {
    pub id: EntityId,
    pub follower_id: EntityId,
    pub following_id: EntityId,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Messaging
// =============================================================================

/// A direct-message conversation between two users
///
/// The pair is unordered but stored as user1/user2; lookups must
/// check both orderings. At most one conversation should exist per
/// unordered pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: EntityId,
    pub user1_id: EntityId,
    pub user2_id: EntityId,
    /// Updated on every new message; drives inbox ordering
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The other participant relative to `viewer`
    pub fn partner_of(&self, viewer: &EntityId) -> &EntityId {
        if &self.user1_id == viewer {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }

    /// Whether `user` participates in this conversation
    pub fn involves(&self, user: &EntityId) -> bool {
        &self.user1_id == user || &self.user2_id == user
    }
}

/// A direct message
///
/// `is_read` transitions false to true only, triggered by the
/// receiving client when it views the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: EntityId,
    pub conversation_id: EntityId,
    pub sender_id: EntityId,
    pub receiver_id: EntityId,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Message,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
            Self::Message => "message",
        }
    }
}

/// Notification for user interactions
///
/// Created exclusively by backend-side triggers; this core only
/// reads and marks-as-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: EntityId,
    /// Target user
    pub user_id: EntityId,
    /// Who caused the notification
    pub actor_id: Option<EntityId>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub post_id: Option<EntityId>,
    pub comment_id: Option<EntityId>,
    pub message_id: Option<EntityId>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Hydrated views
// =============================================================================

/// A post hydrated for display
///
/// Carries the derived counts and per-viewer flags computed at fetch
/// time. This is the unit the optimistic coordinator snapshots and
/// flips; it lives in the entity cache, never remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostView {
    #[serde(flatten)]
    pub post: Post,
    pub author: Option<Profile>,
    pub images: Vec<PostImage>,
    pub likes_count: u64,
    pub comments_count: u64,
    /// Relative to the current viewer
    pub is_liked: bool,
    /// Relative to the current viewer
    pub is_bookmarked: bool,
}

/// A comment with its author attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentView {
    #[serde(flatten)]
    pub comment: Comment,
    pub author: Option<Profile>,
}

/// A profile hydrated with follow counts and viewer relation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: Profile,
    pub followers_count: u64,
    pub following_count: u64,
    /// Whether the current viewer follows this profile
    pub is_following: bool,
}

/// A conversation hydrated for the inbox list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// The other participant relative to the current viewer
    pub partner: Option<Profile>,
    /// Messages addressed to the viewer and not yet read
    pub unread_count: u64,
}

/// A message with its sender profile attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender: Option<Profile>,
}

/// A notification with its actor profile attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub actor: Option<Profile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn conversation_partner_resolution_checks_both_slots() {
        let a = EntityId::new();
        let b = EntityId::new();
        let conversation = Conversation {
            id: EntityId::new(),
            user1_id: a.clone(),
            user2_id: b.clone(),
            last_message_at: Utc::now(),
            created_at: Utc::now(),
        };

        assert_eq!(conversation.partner_of(&a), &b);
        assert_eq!(conversation.partner_of(&b), &a);
        assert!(conversation.involves(&a));
        assert!(!conversation.involves(&EntityId::new()));
    }

    #[test]
    fn post_view_round_trips_with_flattened_fields() {
        let view = PostView {
            post: Post {
                id: EntityId::new(),
                user_id: EntityId::new(),
                content: "hello".to_string(),
                created_at: Utc::now(),
            },
            author: None,
            images: vec![],
            likes_count: 5,
            comments_count: 2,
            is_liked: false,
            is_bookmarked: true,
        };

        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["content"], "hello");
        assert_eq!(value["likes_count"], 5);

        let back: PostView = serde_json::from_value(value).unwrap();
        assert_eq!(back.post.content, "hello");
        assert!(back.is_bookmarked);
    }

    #[test]
    fn notification_kind_serializes_lowercase() {
        let value = serde_json::to_value(NotificationKind::Follow).unwrap();
        assert_eq!(value, "follow");
        assert_eq!(NotificationKind::Follow.as_str(), "follow");
    }
}
