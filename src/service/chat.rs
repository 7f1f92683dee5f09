//! Direct message reads
//!
//! Conversations are unordered user pairs; the inbox orders them by
//! `last_message_at` and carries the partner profile and unread count.
//! Message lists use the shortest cache TTL in the system so an open
//! thread stays close to live even between realtime events.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::data::cache::{CacheKey, EntityCache};
use crate::data::models::{
    Collection, Conversation, ConversationView, EntityId, Message, MessageView,
};
use crate::error::{AppError, Result};
use crate::gateway::{Filter, GatewayError, Query, RemoteGateway};

use super::{decode, feed::fetch_profiles, require_session, swr};

pub struct ChatService {
    gateway: Arc<dyn RemoteGateway>,
    cache: Arc<EntityCache>,
}

impl ChatService {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: Arc<EntityCache>) -> Self {
        Self { gateway, cache }
    }

    /// Cache key for one conversation's message list
    pub fn messages_key(conversation: &EntityId) -> CacheKey {
        CacheKey::query(Collection::Messages, format!("conversation={}", conversation))
    }

    /// Filter matching the pair in either column order
    fn pair_filter(a: &EntityId, b: &EntityId) -> Filter {
        Filter::new()
            .eq("user1_id", a.as_str())
            .eq("user2_id", b.as_str())
            .or()
            .eq("user1_id", b.as_str())
            .eq("user2_id", a.as_str())
    }

    /// The conversation between the two users, if one exists
    pub async fn find_conversation(
        &self,
        a: &EntityId,
        b: &EntityId,
    ) -> Result<Option<Conversation>> {
        let rows = self
            .gateway
            .select(
                Collection::Conversations,
                Query::filtered(Self::pair_filter(a, b)).limit(1),
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(decode(&row)?)),
            None => Ok(None),
        }
    }

    /// The conversation between the two users, created if absent
    ///
    /// A concurrent create from the other side surfaces as a conflict;
    /// that means the row now exists, so the loser refetches it and
    /// both sides converge on the same conversation.
    pub async fn ensure_conversation(
        &self,
        viewer: &EntityId,
        partner: &EntityId,
    ) -> Result<Conversation> {
        if let Some(existing) = self.find_conversation(viewer, partner).await? {
            return Ok(existing);
        }

        let record = json!({
            "user1_id": viewer.as_str(),
            "user2_id": partner.as_str(),
            "last_message_at": Utc::now().to_rfc3339(),
        });
        match self.gateway.insert(Collection::Conversations, record).await {
            Ok(row) => Ok(decode(&row)?),
            Err(GatewayError::Conflict(_)) => self
                .find_conversation(viewer, partner)
                .await?
                .ok_or(AppError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// The viewer's inbox, most recently active first
    pub async fn conversations(&self) -> Result<Vec<ConversationView>> {
        let viewer = require_session(&self.gateway)?;
        let key = CacheKey::query(
            Collection::Conversations,
            format!("inbox;viewer={}", viewer),
        );
        let gateway = Arc::clone(&self.gateway);
        let value = swr(&self.cache, key, move || async move {
            build_conversation_views(gateway, viewer).await
        })
        .await?;
        decode(&value)
    }

    /// Messages in one conversation, oldest first
    pub async fn messages(&self, conversation: &EntityId) -> Result<Vec<MessageView>> {
        let key = Self::messages_key(conversation);
        let gateway = Arc::clone(&self.gateway);
        let conversation = conversation.clone();
        let value = swr(&self.cache, key, move || async move {
            build_message_views(gateway, conversation).await
        })
        .await?;
        decode(&value)
    }

    /// Open a thread: mark messages addressed to the viewer as read,
    /// then return the message list
    ///
    /// Only the receiver's copies flip; the sender's read state is the
    /// partner's business.
    pub async fn open_conversation(&self, conversation: &EntityId) -> Result<Vec<MessageView>> {
        let viewer = require_session(&self.gateway)?;
        self.gateway
            .update(
                Collection::Messages,
                Filter::new()
                    .eq("conversation_id", conversation.as_str())
                    .eq("receiver_id", viewer.as_str())
                    .eq("is_read", false),
                json!({"is_read": true}),
            )
            .await?;

        // Unread counts in the inbox are stale now.
        self.cache.invalidate(&Self::messages_key(conversation)).await;
        self.cache.invalidate_collection(Collection::Conversations);

        self.messages(conversation).await
    }

    /// Unread messages across all conversations, for the inbox badge
    pub async fn unread_total(&self) -> Result<u64> {
        let viewer = require_session(&self.gateway)?;
        Ok(self
            .gateway
            .count(
                Collection::Messages,
                Filter::new()
                    .eq("receiver_id", viewer.as_str())
                    .eq("is_read", false),
            )
            .await?)
    }
}

async fn build_conversation_views(
    gateway: Arc<dyn RemoteGateway>,
    viewer: EntityId,
) -> Result<Value> {
    let rows = gateway
        .select(
            Collection::Conversations,
            Query::filtered(
                Filter::new()
                    .eq("user1_id", viewer.as_str())
                    .or()
                    .eq("user2_id", viewer.as_str()),
            )
            .order_desc("last_message_at"),
        )
        .await?;
    let conversations: Vec<Conversation> = decode(&Value::Array(rows))?;

    let partners = fetch_profiles(
        &gateway,
        conversations
            .iter()
            .map(|c| c.partner_of(&viewer).clone())
            .collect(),
    )
    .await?;

    let mut views = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let unread_count = gateway
            .count(
                Collection::Messages,
                Filter::new()
                    .eq("conversation_id", conversation.id.as_str())
                    .eq("receiver_id", viewer.as_str())
                    .eq("is_read", false),
            )
            .await?;
        let partner = partners
            .get(conversation.partner_of(&viewer).as_str())
            .cloned();
        views.push(ConversationView {
            conversation,
            partner,
            unread_count,
        });
    }
    Ok(serde_json::to_value(views)?)
}

async fn build_message_views(
    gateway: Arc<dyn RemoteGateway>,
    conversation: EntityId,
) -> Result<Value> {
    let rows = gateway
        .select(
            Collection::Messages,
            Query::filtered(Filter::new().eq("conversation_id", conversation.as_str()))
                .order_asc("created_at"),
        )
        .await?;
    let messages: Vec<Message> = decode(&Value::Array(rows))?;

    let senders = fetch_profiles(
        &gateway,
        messages.iter().map(|m| m.sender_id.clone()).collect(),
    )
    .await?;

    let views: Vec<MessageView> = messages
        .into_iter()
        .map(|message| {
            let sender = senders.get(message.sender_id.as_str()).cloned();
            MessageView { message, sender }
        })
        .collect();
    Ok(serde_json::to_value(views)?)
}
