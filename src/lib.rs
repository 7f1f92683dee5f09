//! Tidepool - client-side synchronization core for a social app
//!
//! Keeps a local picture of a hosted social backend (feed, comments,
//! likes, bookmarks, follows, direct messages, notifications) that is
//! fast to read, optimistic to write, and converges on server state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Feed / Chat / Notification / Profile reads (SWR)         │
//! │  - MutationCoordinator (optimistic writes + rollback)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - EntityCache (Moka, TTL + stale-while-revalidate)         │
//! │  - Record and view models                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Gateway Layer                             │
//! │  - RemoteGateway trait                                      │
//! │  - REST binding (PostgREST-style HTTP + object storage)     │
//! │  - In-memory binding (tests)                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The realtime hub sits alongside the services: gateway change feeds
//! turn into cache invalidation, never into direct writes.
//!
//! # Modules
//!
//! - `service`: read services and the mutation coordinator
//! - `data`: models, views and the entity cache
//! - `gateway`: transport trait and its bindings
//! - `realtime`: change feeds to cache invalidation
//! - `config`: configuration management
//! - `error`: error types and user-facing notices
//! - `metrics`: Prometheus instruments
//! - `telemetry`: tracing setup

pub mod config;
pub mod data;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod realtime;
pub mod service;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::data::cache::EntityCache;
use crate::error::{Notice, Result};
use crate::gateway::rest::RestGateway;
use crate::gateway::RemoteGateway;
use crate::realtime::RealtimeHub;
use crate::service::{
    ChatService, FeedService, MutationCoordinator, NotificationService, ProfileService,
};

/// Everything an embedding application needs, wired together
///
/// All components share one gateway and one cache. Cloning is cheap;
/// the parts are reference-counted.
#[derive(Clone)]
pub struct Client {
    pub config: Arc<AppConfig>,
    pub cache: Arc<EntityCache>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub feed: Arc<FeedService>,
    pub chat: Arc<ChatService>,
    pub notifications: Arc<NotificationService>,
    pub profiles: Arc<ProfileService>,
    pub mutations: Arc<MutationCoordinator>,
    pub realtime: Arc<RealtimeHub>,
}

impl Client {
    /// Build a client against the configured REST backend
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let gateway = RestGateway::new(&config.gateway)?
            .with_poll_interval(Duration::from_secs(config.realtime.poll_interval_seconds))
            .with_channel_capacity(config.realtime.channel_capacity);
        Ok(Self::with_gateway(config, Arc::new(gateway)))
    }

    /// Build a client on top of any gateway binding
    pub fn with_gateway(config: AppConfig, gateway: Arc<dyn RemoteGateway>) -> Self {
        let cache = Arc::new(EntityCache::new(&config.cache));
        let (notices, _) = broadcast::channel(32);

        let feed = Arc::new(FeedService::new(Arc::clone(&gateway), Arc::clone(&cache)));
        let chat = Arc::new(ChatService::new(Arc::clone(&gateway), Arc::clone(&cache)));
        let notifications = Arc::new(NotificationService::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
        ));
        let profiles = Arc::new(ProfileService::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
        ));
        let mutations = Arc::new(MutationCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Arc::clone(&chat),
            &config.gateway,
            config.limits.clone(),
            notices,
        ));
        let realtime = Arc::new(RealtimeHub::new(Arc::clone(&gateway), Arc::clone(&cache)));

        Self {
            config: Arc::new(config),
            cache,
            gateway,
            feed,
            chat,
            notifications,
            profiles,
            mutations,
            realtime,
        }
    }

    /// Listen for user-facing notices from failed mutations
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.mutations.subscribe_notices()
    }
}
