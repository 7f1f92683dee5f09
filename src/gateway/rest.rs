//! REST gateway binding
//!
//! Talks to a PostgREST-style backend: collections are tables under
//! `/rest/v1`, filters render to the operator query grammar, blobs go
//! to the storage API. Change feeds are polled inserts; updates and
//! deletes surface through cache TTLs instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::config::GatewayConfig;
use crate::data::models::{Collection, EntityId};
use crate::error::AppError;
use crate::metrics::{GATEWAY_REQUESTS_TOTAL, GATEWAY_REQUEST_DURATION_SECONDS};

use super::{
    ChangeEvent, ChangeKind, Condition, Filter, GatewayError, Query, RemoteGateway, Scope,
    Subscription,
};

/// Active credentials: the anon key, or a signed-in user's token
#[derive(Clone)]
struct Session {
    user: EntityId,
    access_token: String,
}

/// PostgREST-over-HTTP binding
#[derive(Clone)]
pub struct RestGateway {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    poll_interval: Duration,
    channel_capacity: usize,
    session: Arc<RwLock<Option<Session>>>,
}

impl RestGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, AppError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AppError::Config(format!("invalid gateway base URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_secs(3),
            channel_capacity: 64,
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Buffer size of each subscription's event channel
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Adopt an authenticated session obtained from the auth endpoint
    pub fn set_session(&self, user: EntityId, access_token: String) {
        *self.session.write() = Some(Session { user, access_token });
    }

    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    fn bearer(&self) -> String {
        match self.session.read().as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.api_key.clone(),
        }
    }

    fn rest_url(&self, collection: Collection) -> Result<Url, GatewayError> {
        self.base_url
            .join(&format!("rest/v1/{}", collection.as_str()))
            .map_err(|e| GatewayError::Malformed(format!("bad collection URL: {}", e)))
    }

    fn storage_url(&self, bucket: &str, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(&format!("storage/v1/object/{}/{}", bucket, path))
            .map_err(|e| GatewayError::Malformed(format!("bad storage URL: {}", e)))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer())
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
        collection: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let timer = GATEWAY_REQUEST_DURATION_SECONDS
            .with_label_values(&[operation, collection])
            .start_timer();
        let result = request.send().await;
        timer.observe_duration();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                GATEWAY_REQUESTS_TOTAL
                    .with_label_values(&[operation, collection, "unreachable"])
                    .inc();
                return Err(GatewayError::Unreachable(e.to_string()));
            }
        };

        let status = response.status();
        let outcome = if status.is_success() { "ok" } else { "error" };
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&[operation, collection, outcome])
            .inc();

        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::PermissionDenied,
            StatusCode::NOT_FOUND => GatewayError::NotFound,
            StatusCode::CONFLICT => GatewayError::Conflict(detail),
            _ => GatewayError::Malformed(format!("unexpected status {}: {}", status, detail)),
        })
    }

    async fn json_rows(response: reqwest::Response) -> Result<Vec<Value>, GatewayError> {
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(GatewayError::Malformed(format!(
                "expected an array of rows, got {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Query grammar rendering
// =============================================================================

/// Render a condition as a `field=op.value` query pair
fn pair_param(condition: &Condition) -> (String, String) {
    match condition {
        Condition::Eq(field, value) => (field.clone(), format!("eq.{}", scalar(value))),
        Condition::In(field, values) => (field.clone(), format!("in.({})", values.join(","))),
        Condition::Gt(field, bound) => (field.clone(), format!("gt.{}", bound)),
    }
}

/// Render a condition in the logic-tree form used inside `or=(...)`
fn logic_term(condition: &Condition) -> String {
    match condition {
        Condition::Eq(field, value) => {
            format!("{}.eq.{}", field, urlencoding::encode(&scalar(value)))
        }
        Condition::In(field, values) => format!(
            "{}.in.({})",
            field,
            urlencoding::encode(&values.join(","))
        ),
        Condition::Gt(field, bound) => format!("{}.gt.{}", field, urlencoding::encode(bound)),
    }
}

fn scalar(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Filter as query parameters
///
/// A single conjunction renders as plain `field=op.value` pairs; a
/// disjunction renders as one `or=(and(...),and(...))` parameter.
fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    let groups: Vec<_> = filter
        .groups()
        .iter()
        .filter(|group| !group.is_empty())
        .collect();

    match groups.as_slice() {
        [] => Vec::new(),
        [only] => only.iter().map(pair_param).collect(),
        many => {
            let alternatives = many
                .iter()
                .map(|group| {
                    let terms = group.iter().map(logic_term).collect::<Vec<_>>().join(",");
                    format!("and({})", terms)
                })
                .collect::<Vec<_>>()
                .join(",");
            vec![("or".to_string(), format!("({})", alternatives))]
        }
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = filter_params(&query.filter);
    if let Some((field, direction)) = &query.order {
        params.push(("order".to_string(), format!("{}.{}", field, direction)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.parse().ok()
}

#[async_trait]
impl RemoteGateway for RestGateway {
    async fn select(
        &self,
        collection: Collection,
        query: Query,
    ) -> Result<Vec<Value>, GatewayError> {
        let url = self.rest_url(collection)?;
        let request = self
            .request(reqwest::Method::GET, url)
            .query(&query_params(&query));
        let response = self.execute(request, "select", collection.as_str()).await?;
        Self::json_rows(response).await
    }

    async fn count(&self, collection: Collection, filter: Filter) -> Result<u64, GatewayError> {
        let url = self.rest_url(collection)?;
        let request = self
            .request(reqwest::Method::HEAD, url)
            .query(&filter_params(&filter))
            .header("Prefer", "count=exact");
        let response = self.execute(request, "count", collection.as_str()).await?;

        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| GatewayError::Malformed("missing count in content-range".to_string()))
    }

    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        let url = self.rest_url(collection)?;
        let request = self
            .request(reqwest::Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&record);
        let response = self.execute(request, "insert", collection.as_str()).await?;

        Self::json_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Malformed("insert returned no row".to_string()))
    }

    async fn update(
        &self,
        collection: Collection,
        filter: Filter,
        patch: Value,
    ) -> Result<Vec<Value>, GatewayError> {
        let url = self.rest_url(collection)?;
        let request = self
            .request(reqwest::Method::PATCH, url)
            .query(&filter_params(&filter))
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = self.execute(request, "update", collection.as_str()).await?;
        Self::json_rows(response).await
    }

    async fn delete(&self, collection: Collection, filter: Filter) -> Result<(), GatewayError> {
        let url = self.rest_url(collection)?;
        let request = self
            .request(reqwest::Method::DELETE, url)
            .query(&filter_params(&filter));
        self.execute(request, "delete", collection.as_str()).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        use crate::metrics::BLOB_UPLOADS_TOTAL;

        let url = self.storage_url(bucket, path)?;
        let request = self
            .request(reqwest::Method::POST, url)
            .header("Content-Type", content_type)
            .body(bytes);
        let result = self.execute(request, "upload", "storage").await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        BLOB_UPLOADS_TOTAL.with_label_values(&[bucket, outcome]).inc();
        result.map(|_| ())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.base_url
            .join(&format!("storage/v1/object/public/{}/{}", bucket, path))
            .map(|url| url.to_string())
            .unwrap_or_default()
    }

    /// Poll the collection for rows created after subscription time
    ///
    /// Each cycle fetches rows past the watermark, oldest first, and
    /// reports them as inserts. A random per-cycle jitter keeps many
    /// subscriptions from polling in lockstep.
    fn subscribe(&self, collection: Collection, scope: Scope) -> Subscription {
        let gateway = self.clone();
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let task = tokio::spawn(async move {
            let mut watermark = Utc::now().to_rfc3339();
            loop {
                let jitter = rand::thread_rng().gen_range(0..500);
                tokio::time::sleep(gateway.poll_interval + Duration::from_millis(jitter)).await;

                let query = Query::filtered(scope.to_filter().gt("created_at", &watermark))
                    .order_asc("created_at");
                let rows = match gateway.select(collection, query).await {
                    Ok(rows) => rows,
                    Err(error) => {
                        tracing::debug!(%error, collection = %collection, "change poll failed");
                        continue;
                    }
                };

                for row in rows {
                    if let Some(created_at) = row.get("created_at").and_then(Value::as_str) {
                        if created_at > watermark.as_str() {
                            watermark = created_at.to_string();
                        }
                    }
                    let id = row
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let event = ChangeEvent {
                        kind: ChangeKind::Insert,
                        collection,
                        id: EntityId(id),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Subscription::new(collection, rx, task)
    }

    fn session(&self) -> Option<EntityId> {
        self.session.read().as_ref().map(|s| s.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_conjunction_renders_as_plain_pairs() {
        let filter = Filter::new().eq("post_id", "p1").eq("user_id", "u1");
        assert_eq!(
            filter_params(&filter),
            vec![
                ("post_id".to_string(), "eq.p1".to_string()),
                ("user_id".to_string(), "eq.u1".to_string()),
            ]
        );
    }

    #[test]
    fn disjunction_renders_as_or_parameter() {
        let filter = Filter::new()
            .eq("user1_id", "a")
            .eq("user2_id", "b")
            .or()
            .eq("user1_id", "b")
            .eq("user2_id", "a");
        assert_eq!(
            filter_params(&filter),
            vec![(
                "or".to_string(),
                "(and(user1_id.eq.a,user2_id.eq.b),and(user1_id.eq.b,user2_id.eq.a))".to_string()
            )]
        );
    }

    #[test]
    fn empty_filter_renders_no_parameters() {
        assert!(filter_params(&Filter::new()).is_empty());
    }

    #[test]
    fn order_and_limit_append_after_filter() {
        let query = Query::filtered(Filter::new().eq("user_id", "u1"))
            .order_desc("created_at")
            .limit(50);
        assert_eq!(
            query_params(&query),
            vec![
                ("user_id".to_string(), "eq.u1".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn realtime_tuning_knobs_apply() {
        let gateway = RestGateway::new(&GatewayConfig {
            base_url: "https://backend.example.com/".to_string(),
            api_key: "anon-key".to_string(),
            post_images_bucket: "post-images".to_string(),
            avatars_bucket: "avatars".to_string(),
            request_timeout_seconds: 10,
        })
        .unwrap()
        .with_poll_interval(Duration::from_secs(1))
        .with_channel_capacity(8);
        assert_eq!(gateway.poll_interval, Duration::from_secs(1));
        assert_eq!(gateway.channel_capacity, 8);
    }

    #[test]
    fn public_urls_point_at_the_storage_api() {
        let gateway = RestGateway::new(&GatewayConfig {
            base_url: "https://backend.example.com/".to_string(),
            api_key: "anon-key".to_string(),
            post_images_bucket: "post-images".to_string(),
            avatars_bucket: "avatars".to_string(),
            request_timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(
            gateway.public_url("avatars", "u1/avatar.png"),
            "https://backend.example.com/storage/v1/object/public/avatars/u1/avatar.png"
        );
    }
}
