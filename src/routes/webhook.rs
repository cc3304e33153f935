use super::{AppError, AppJson, Owner};
use crate::{
    state::AppState,
    store::models::{NewWebhook, Webhook, WebhookChanges, WebhookEvent, WebhookMethod},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;
use utoipa::ToSchema;

const OPENAPI_TAG: &str = "Webhook";

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhook {
    label: String,
    #[schema(value_type = String)]
    url: Url,
    method: WebhookMethod,
    #[schema(value_type = Option<Object>)]
    request_config: Option<Value>,
}

/// Fields left out stay unchanged; `requestConfig: null` clears the config.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhook {
    label: Option<String>,
    #[schema(value_type = Option<String>)]
    url: Option<Url>,
    method: Option<WebhookMethod>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<Object>)]
    request_config: Option<Option<Value>>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Value>::deserialize(deserializer).map(Some)
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    #[serde(flatten)]
    webhook: Webhook,
    event_count: usize,
}

fn validate_label(label: &str) -> Result<String, AppError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(AppError::BadRequest("label is required".to_string()));
    }
    Ok(label.to_string())
}

fn validate_request_config(config: &Option<Value>) -> Result<(), AppError> {
    match config {
        None | Some(Value::Object(_)) | Some(Value::Null) => Ok(()),
        Some(_) => Err(AppError::BadRequest(
            "requestConfig must be a JSON object".to_string(),
        )),
    }
}

/// Load a webhook the caller owns; anything else is reported as missing.
async fn owned_webhook(
    app_state: &AppState,
    owner_id: u64,
    id: u64,
) -> Result<Webhook, AppError> {
    app_state
        .store()
        .get_webhook(id)
        .await?
        .filter(|w| w.owner_id == owner_id)
        .ok_or_else(|| AppError::NotFoundError(anyhow::anyhow!("webhook not found")))
}

/// Create webhook
///
/// Register an endpoint that is called whenever one of the caller's processes finishes.
#[utoipa::path(
    post,
    path = "/api/webhook",
    request_body = CreateWebhook,
    params(("x-user-id" = u64, Header, description = "Owner id")),
    responses(
        (status = OK, body = Webhook),
        (status = BAD_REQUEST, body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn create(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    AppJson(data): AppJson<CreateWebhook>,
) -> Result<AppJson<Webhook>, AppError> {
    let label = validate_label(&data.label)?;
    validate_request_config(&data.request_config)?;

    let webhook = app_state
        .store()
        .create_webhook(NewWebhook {
            owner_id,
            label,
            url: data.url,
            method: data.method,
            request_config: data.request_config.filter(|v| !v.is_null()),
        })
        .await?;

    tracing::info!("webhook {} created for user {}", webhook.id, owner_id);
    Ok(AppJson(webhook))
}

/// List webhooks
#[utoipa::path(
    get,
    path = "/api/webhook",
    params(("x-user-id" = u64, Header, description = "Owner id")),
    responses((status = OK, body = Vec<WebhookResponse>)),
    tag = OPENAPI_TAG
)]
pub async fn list(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
) -> Result<AppJson<Vec<WebhookResponse>>, AppError> {
    let store = app_state.store();
    let mut webhooks = vec![];
    for webhook in store.list_webhooks(owner_id).await? {
        let event_count = store.list_webhook_events(webhook.id).await?.len();
        webhooks.push(WebhookResponse {
            webhook,
            event_count,
        });
    }
    Ok(AppJson(webhooks))
}

/// Get webhook
#[utoipa::path(
    get,
    path = "/api/webhook/{id}",
    params(
        ("id" = u64, Path, description = "Webhook id"),
        ("x-user-id" = u64, Header, description = "Owner id"),
    ),
    responses(
        (status = OK, body = WebhookResponse),
        (status = NOT_FOUND, body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn detail(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<u64>,
) -> Result<AppJson<WebhookResponse>, AppError> {
    let webhook = owned_webhook(&app_state, owner_id, id).await?;
    let event_count = app_state.store().list_webhook_events(id).await?.len();
    Ok(AppJson(WebhookResponse {
        webhook,
        event_count,
    }))
}

/// Update webhook
#[utoipa::path(
    patch,
    path = "/api/webhook/{id}",
    request_body = UpdateWebhook,
    params(
        ("id" = u64, Path, description = "Webhook id"),
        ("x-user-id" = u64, Header, description = "Owner id"),
    ),
    responses(
        (status = OK, body = Webhook),
        (status = NOT_FOUND, body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn update(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<u64>,
    AppJson(data): AppJson<UpdateWebhook>,
) -> Result<AppJson<Webhook>, AppError> {
    owned_webhook(&app_state, owner_id, id).await?;

    let label = data.label.as_deref().map(validate_label).transpose()?;
    if let Some(config) = &data.request_config {
        validate_request_config(config)?;
    }

    let webhook = app_state
        .store()
        .update_webhook(
            id,
            WebhookChanges {
                label,
                url: data.url,
                method: data.method,
                request_config: data
                    .request_config
                    .map(|config| config.filter(|v| !v.is_null())),
            },
        )
        .await?;

    Ok(AppJson(webhook))
}

/// Delete webhook
///
/// Delivery events of the webhook are kept.
#[utoipa::path(
    delete,
    path = "/api/webhook/{id}",
    params(
        ("id" = u64, Path, description = "Webhook id"),
        ("x-user-id" = u64, Header, description = "Owner id"),
    ),
    responses(
        (status = NO_CONTENT),
        (status = NOT_FOUND, body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn remove(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<u64>,
) -> Result<StatusCode, AppError> {
    owned_webhook(&app_state, owner_id, id).await?;
    app_state.store().delete_webhook(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// List webhook events
///
/// Delivery attempts of one webhook, newest first.
#[utoipa::path(
    get,
    path = "/api/webhook/{id}/events",
    params(
        ("id" = u64, Path, description = "Webhook id"),
        ("x-user-id" = u64, Header, description = "Owner id"),
    ),
    responses(
        (status = OK, body = Vec<WebhookEvent>),
        (status = NOT_FOUND, body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn events(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<u64>,
) -> Result<AppJson<Vec<WebhookEvent>>, AppError> {
    owned_webhook(&app_state, owner_id, id).await?;
    let events = app_state.store().list_webhook_events(id).await?;

    Ok(AppJson(events))
}

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:id", get(detail).patch(update).delete(remove))
        .route("/:id/events", get(events))
}
