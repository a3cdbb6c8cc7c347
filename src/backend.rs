//! Index backend abstraction and the Elasticsearch bulk client.
//!
//! Defines the [`Backend`] trait the delivery workers write through, and
//! [`ElasticsearchBackend`], which sends batches to the `_bulk` endpoint as
//! newline-delimited JSON.
//!
//! # Failure Classification
//!
//! Every failed call is reported as a [`DeliveryError`] so the workers know
//! whether a retry can help:
//! - Network errors and timeouts → transient
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - HTTP 4xx (client error, not 429) → permanent
//! - `errors: true` responses → rejected items are returned in
//!   [`BulkOutcome::failed_items`]; if any item was rejected with 429 the
//!   batch is reported as [`DeliveryError::RateLimited`], which is retried
//!   whole (indexing by id is idempotent) and still names the failed items
//! - Unreadable response body → transient; undecodable body → permanent

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::DeliveryError;
use crate::models::{BulkAction, BulkOutcome};

/// A destination for bulk writes.
///
/// Implementations must be safe to call from several delivery workers at
/// once; each call carries one batch.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label used in logs (e.g. `"elasticsearch"`).
    fn name(&self) -> &str;

    /// Writes one batch. A returned `Ok` means the backend answered; items
    /// it rejected individually are listed in the outcome.
    async fn deliver(&self, actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError>;
}

/// Bulk client for an Elasticsearch-compatible `_bulk` endpoint.
pub struct ElasticsearchBackend {
    client: reqwest::Client,
    bulk_url: String,
}

impl ElasticsearchBackend {
    /// Builds a client for `{scheme}://{host}:{port}/_bulk`.
    ///
    /// The request timeout is set slightly above `attempt_timeout` so the
    /// worker's own timeout is the one that fires.
    pub fn new(config: &BackendConfig, attempt_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout + Duration::from_secs(1))
            .build()?;

        Ok(Self {
            client,
            bulk_url: format!("{}/_bulk", config.base_url()),
        })
    }

    pub fn bulk_url(&self) -> &str {
        &self.bulk_url
    }
}

#[async_trait]
impl Backend for ElasticsearchBackend {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn deliver(&self, actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        let body = encode_bulk_body(actions)
            .map_err(|e| DeliveryError::Permanent(format!("could not encode batch: {}", e)))?;

        let response = self
            .client
            .post(&self.bulk_url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("{} unreachable: {}", self.bulk_url, e)))?;

        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| {
                DeliveryError::Transient(format!("could not read bulk response: {}", e))
            })?;
            let json: Value = serde_json::from_slice(&bytes).map_err(|e| {
                DeliveryError::Permanent(format!("invalid bulk response: {}", e))
            })?;
            let took = json.get("took").and_then(Value::as_u64).unwrap_or(0);
            debug!(items = actions.len(), took, "bulk request accepted");
            return parse_bulk_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();

        // Rate limited or server error: retry
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DeliveryError::Transient(format!(
                "bulk API error {}: {}",
                status, body_text
            )));
        }

        Err(DeliveryError::Permanent(format!(
            "bulk API error {}: {}",
            status, body_text
        )))
    }
}

/// Encodes actions as a `_bulk` request body.
///
/// Each action becomes an `index` metadata line followed by the document
/// line. The action timestamp is added to the document as `@timestamp`
/// unless the document already carries one.
pub fn encode_bulk_body(actions: &[BulkAction]) -> Result<String, serde_json::Error> {
    let mut body = String::new();

    for action in actions {
        let mut meta = serde_json::Map::new();
        meta.insert("_index".to_string(), Value::from(action.index.as_str()));
        if let Some(doc_type) = &action.doc_type {
            meta.insert("_type".to_string(), Value::from(doc_type.as_str()));
        }
        meta.insert("_id".to_string(), Value::from(action.doc_id.as_str()));

        let header = serde_json::json!({ "index": meta });
        body.push_str(&serde_json::to_string(&header)?);
        body.push('\n');

        let mut doc = action.body.clone();
        if let Value::Object(map) = &mut doc {
            map.entry("@timestamp")
                .or_insert_with(|| serde_json::to_value(action.timestamp).unwrap_or(Value::Null));
        }
        body.push_str(&serde_json::to_string(&doc)?);
        body.push('\n');
    }

    Ok(body)
}

/// Interprets a `_bulk` response body.
pub fn parse_bulk_response(json: &Value) -> Result<BulkOutcome, DeliveryError> {
    if !json.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(BulkOutcome::default());
    }

    let items = json
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| DeliveryError::Permanent("bulk response missing items array".to_string()))?;

    let mut outcome = BulkOutcome::default();
    let mut rate_limited = 0usize;

    for item in items {
        // Each item is keyed by its action name: {"index": {...}}
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        if (200..300).contains(&status) {
            continue;
        }
        if status == 429 {
            rate_limited += 1;
        }

        let id = result
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reason = result
            .get("error")
            .map(|e| match e.get("reason").and_then(Value::as_str) {
                Some(reason) => reason.to_string(),
                None => e.to_string(),
            })
            .unwrap_or_else(|| format!("status {}", status));
        outcome.failed_items.push((id, reason));
    }

    if rate_limited > 0 {
        return Err(DeliveryError::RateLimited {
            reason: format!("{} bulk items rejected with 429", rate_limited),
            failed_items: outcome.failed_items,
        });
    }

    Ok(outcome)
}
