use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Processing,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Processing)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: u64,
    pub created_by_id: u64,
    pub image_amount: usize,
    /// Path of the output directory relative to the served root, e.g. `/output/process_1717...`.
    pub output_url: String,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub finished_processing_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewProcess {
    pub created_by_id: u64,
    pub image_amount: usize,
    pub output_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl WebhookMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookMethod::Get => "GET",
            WebhookMethod::Post => "POST",
            WebhookMethod::Put => "PUT",
            WebhookMethod::Patch => "PATCH",
            WebhookMethod::Delete => "DELETE",
        }
    }
}

impl From<WebhookMethod> for reqwest::Method {
    fn from(method: WebhookMethod) -> Self {
        match method {
            WebhookMethod::Get => reqwest::Method::GET,
            WebhookMethod::Post => reqwest::Method::POST,
            WebhookMethod::Put => reqwest::Method::PUT,
            WebhookMethod::Patch => reqwest::Method::PATCH,
            WebhookMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: u64,
    pub owner_id: u64,
    pub label: String,
    #[schema(value_type = String)]
    pub url: Url,
    pub method: WebhookMethod,
    #[schema(value_type = Option<Object>)]
    pub request_config: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewWebhook {
    pub owner_id: u64,
    pub label: String,
    pub url: Url,
    pub method: WebhookMethod,
    pub request_config: Option<Value>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Clone, Debug, Default)]
pub struct WebhookChanges {
    pub label: Option<String>,
    pub url: Option<Url>,
    pub method: Option<WebhookMethod>,
    pub request_config: Option<Option<Value>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: u64,
    pub webhook_id: u64,
    pub process_id: u64,
    #[schema(value_type = Object)]
    pub request: Value,
    #[schema(value_type = Object)]
    pub response: Value,
    pub response_status: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewWebhookEvent {
    pub webhook_id: u64,
    pub process_id: u64,
    pub request: Value,
    pub response: Value,
    pub response_status: u16,
}
