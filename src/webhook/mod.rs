use crate::store::{
    models::{NewWebhookEvent, ProcessStatus, Webhook},
    Store,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use utoipa::ToSchema;

/// Body sent to every webhook once a process reaches a terminal status.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub process_id: u64,
    pub status: ProcessStatus,
    pub image_urls: Vec<String>,
    pub image_amount: usize,
    pub finished_processing_at: DateTime<Utc>,
}

/// Extra request settings read from a webhook's `requestConfig`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RequestConfig {
    headers: Map<String, Value>,
    query: Map<String, Value>,
}

impl RequestConfig {
    fn from_webhook(webhook: &Webhook) -> Self {
        match &webhook.request_config {
            Some(config) => serde_json::from_value(config.clone()).unwrap_or_else(|e| {
                tracing::warn!("webhook {} has unusable requestConfig: {}", webhook.id, e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Configured headers, one value per name. `content-type` defaults to JSON
    /// unless the webhook overrides it.
    fn headers(&self, webhook_id: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in string_pairs(&self.headers) {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!("webhook {} skips invalid header `{}`", webhook_id, name),
            }
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers
    }

    fn query(&self) -> Vec<(String, String)> {
        string_pairs(&self.query)
    }
}

fn string_pairs(map: &Map<String, Value>) -> Vec<(String, String)> {
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k.clone(), s.clone()),
            other => (k.clone(), other.to_string()),
        })
        .collect()
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
                )
            })
            .collect(),
    )
}

fn pairs_to_json(pairs: &[(String, String)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Delivers completion payloads and appends one event per attempt.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: Client,
    store: Arc<dyn Store>,
}

impl WebhookNotifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            client: Client::new(),
            store,
        }
    }

    /// Deliver `payload` to every webhook concurrently. Never fails; each attempt
    /// is recorded as a webhook event.
    pub async fn notify(&self, webhooks: &[Webhook], payload: &CompletionPayload) {
        let deliveries = webhooks.iter().map(|webhook| async move {
            let event = self.deliver(webhook, payload).await;
            let status = event.response_status;
            if let Err(e) = self.store.create_webhook_event(event).await {
                tracing::error!(
                    "failed to record delivery to webhook {}: {}",
                    webhook.id,
                    e
                );
            }
            status
        });

        let statuses = join_all(deliveries).await;
        tracing::info!(
            "notified {} webhooks for process {}: {:?}",
            webhooks.len(),
            payload.process_id,
            statuses
        );
    }

    async fn deliver(&self, webhook: &Webhook, payload: &CompletionPayload) -> NewWebhookEvent {
        let config = RequestConfig::from_webhook(webhook);
        let headers = config.headers(webhook.id);
        let query = config.query();

        let request = json!({
            "method": webhook.method.as_str(),
            "url": webhook.url.as_str(),
            "headers": headers_to_json(&headers),
            "query": pairs_to_json(&query),
            "data": payload,
        });

        // headers first, so `json` keeps a configured content-type
        let mut builder = self
            .client
            .request(webhook.method.into(), webhook.url.clone())
            .headers(headers)
            .json(payload);
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        let (response, response_status) = match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let body = match response.text().await {
                    Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
                    Err(e) => json!({ "error": e.to_string() }),
                };

                if status.is_success() {
                    (body, status.as_u16())
                } else {
                    tracing::warn!("webhook {} responded with {}", webhook.id, status);
                    (
                        json!({
                            "error": format!("Request failed with status code {}", status.as_u16()),
                            "body": body,
                        }),
                        status.as_u16(),
                    )
                }
            }
            Err(e) => {
                tracing::warn!("failed to deliver webhook {}: {}", webhook.id, e);
                let status = e.status().map(|s| s.as_u16()).unwrap_or(500);
                (json!({ "error": e.to_string() }), status)
            }
        };

        NewWebhookEvent {
            webhook_id: webhook.id,
            process_id: payload.process_id,
            request,
            response,
            response_status,
        }
    }
}
