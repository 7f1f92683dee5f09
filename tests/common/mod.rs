//! Shared test fixtures
//!
//! Builds a full client over the in-memory gateway with a pair of
//! seeded profiles, so end-to-end tests read and write through the
//! same stack the application would.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use tidepool::config::{
    AppConfig, CacheConfig, GatewayConfig, LimitsConfig, LoggingConfig, RealtimeConfig,
};
use tidepool::data::models::{Collection, EntityId};
use tidepool::gateway::memory::InMemoryGateway;
use tidepool::gateway::RemoteGateway;
use tidepool::Client;

pub struct TestApp {
    pub client: Client,
    pub gateway: Arc<InMemoryGateway>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        gateway: GatewayConfig {
            base_url: "memory://test".to_string(),
            api_key: "test-key".to_string(),
            post_images_bucket: "post-images".to_string(),
            avatars_bucket: "avatars".to_string(),
            request_timeout_seconds: 10,
        },
        cache: CacheConfig {
            default_ttl_seconds: 300,
            conversations_ttl_seconds: 120,
            messages_ttl_seconds: 60,
        },
        realtime: RealtimeConfig {
            poll_interval_seconds: 3,
            channel_capacity: 64,
        },
        limits: LimitsConfig {
            max_post_images: 4,
            max_image_bytes: 5 * 1024 * 1024,
            max_bio_chars: 160,
            max_display_name_chars: 50,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// A client over a fresh in-memory backend, signed in as `alice`
pub fn spawn_app() -> TestApp {
    let gateway = Arc::new(InMemoryGateway::new());
    seed_profile(&gateway, "alice", "alice");
    seed_profile(&gateway, "bob", "bob");
    gateway.sign_in(EntityId("alice".to_string()));

    let client = Client::with_gateway(test_config(), gateway.clone() as Arc<dyn RemoteGateway>);
    TestApp { client, gateway }
}

pub fn seed_profile(gateway: &InMemoryGateway, id: &str, username: &str) {
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

pub fn seed_post(gateway: &InMemoryGateway, id: &str, author: &str, at: &str) {
    gateway.seed(
        Collection::Posts,
        vec![json!({
            "id": id,
            "user_id": author,
            "content": "seeded post",
            "created_at": at,
        })],
    );
}

pub fn alice() -> EntityId {
    EntityId("alice".to_string())
}

pub fn bob() -> EntityId {
    EntityId("bob".to_string())
}
