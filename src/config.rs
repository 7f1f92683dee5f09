//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

/// Remote gateway configuration (hosted backend)
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Backend base URL (e.g., "https://abc123.backend.example")
    pub base_url: String,
    /// Project API key sent with every request
    pub api_key: String,
    /// Bucket for post image attachments
    pub post_images_bucket: String,
    /// Bucket for profile avatars
    pub avatars_bucket: String,
    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
}

/// Entity cache configuration
///
/// TTLs control staleness, not eviction: entries past their TTL are
/// still served while a background refetch runs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Default entry TTL in seconds (default: 300)
    pub default_ttl_seconds: u64,
    /// Conversation list TTL in seconds (default: 120)
    pub conversations_ttl_seconds: u64,
    /// Message list TTL in seconds (default: 60)
    pub messages_ttl_seconds: u64,
}

/// Realtime change-feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Poll interval for the REST binding's change feed, in seconds
    pub poll_interval_seconds: u64,
    /// Event channel capacity per subscription
    pub channel_capacity: usize,
}

/// Client-side validation limits
///
/// Values mirror what the backend enforces so invalid input is
/// rejected before any remote call.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum images per post (default: 4)
    pub max_post_images: usize,
    /// Maximum image upload size in bytes (default: 5 MiB)
    pub max_image_bytes: usize,
    /// Maximum bio length in characters (default: 160)
    pub max_bio_chars: usize,
    /// Maximum display name length in characters (default: 50)
    pub max_display_name_chars: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (TIDEPOOL_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("gateway.post_images_bucket", "post-images")?
            .set_default("gateway.avatars_bucket", "avatars")?
            .set_default("gateway.request_timeout_seconds", 30)?
            .set_default("cache.default_ttl_seconds", 300)?
            .set_default("cache.conversations_ttl_seconds", 120)?
            .set_default("cache.messages_ttl_seconds", 60)?
            .set_default("realtime.poll_interval_seconds", 3)?
            .set_default("realtime.channel_capacity", 64)?
            .set_default("limits.max_post_images", 4)?
            .set_default("limits.max_image_bytes", 5 * 1024 * 1024)?
            .set_default("limits.max_bio_chars", 160)?
            .set_default("limits.max_display_name_chars", 50)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (TIDEPOOL_*)
            .add_source(
                Environment::with_prefix("TIDEPOOL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if url::Url::parse(&self.gateway.base_url).is_err() {
            return Err(crate::error::AppError::Config(format!(
                "gateway.base_url is not a valid URL: {}",
                self.gateway.base_url
            )));
        }

        if self.gateway.api_key.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "gateway.api_key must not be empty".to_string(),
            ));
        }

        if self.cache.default_ttl_seconds == 0
            || self.cache.conversations_ttl_seconds == 0
            || self.cache.messages_ttl_seconds == 0
        {
            return Err(crate::error::AppError::Config(
                "cache TTLs must be greater than 0".to_string(),
            ));
        }

        if self.realtime.poll_interval_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "realtime.poll_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.limits.max_post_images == 0 {
            return Err(crate::error::AppError::Config(
                "limits.max_post_images must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            gateway: GatewayConfig {
                base_url: "https://backend.test.example.com".to_string(),
                api_key: "test-api-key".to_string(),
                post_images_bucket: "post-images".to_string(),
                avatars_bucket: "avatars".to_string(),
                request_timeout_seconds: 30,
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
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_invalid_base_url() {
        let mut config = valid_config();
        config.gateway.base_url = "not a url".to_string();

        let error = config
            .validate()
            .expect_err("invalid base URL must fail validation");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("gateway.base_url")
        ));
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let mut config = valid_config();
        config.cache.messages_ttl_seconds = 0;

        let error = config.validate().expect_err("zero TTL must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("TTL")
        ));
    }

    #[test]
    fn validate_rejects_empty_api_key() {
        let mut config = valid_config();
        config.gateway.api_key = "  ".to_string();

        assert!(config.validate().is_err());
    }
}
