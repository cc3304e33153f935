pub mod process;
pub mod webhook;

use crate::{batch::queue::SubmitError, store::StoreError};
use axum::{
    async_trait,
    extract::{multipart::MultipartError, rejection::JsonRejection, FromRequest, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::OpenApi;

pub const USER_HEADER: &str = "x-user-id";

// Wraps `axum::Json` so a rejected body is reported through `AppError` as JSON
// instead of axum's plain text.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    axum::Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Id of the authenticated user, forwarded by the gateway in `x-user-id`.
#[derive(Clone, Copy, Debug)]
pub struct Owner(pub u64);

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .map(Owner)
            .ok_or(AppError::Unauthorized)
    }
}

#[derive(Debug)]
pub enum AppError {
    JsonRejection(JsonRejection),
    Multipart(MultipartError),
    BadRequest(String),
    Unauthorized,
    NotFoundError(anyhow::Error),
    TooManyRequests,
    InternalServerError(anyhow::Error),
}

// Tell axum how `AppError` should be converted into a response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let (status, message) = match self {
            AppError::JsonRejection(rejection) => {
                // bad user input, not worth logging
                (rejection.status(), rejection.body_text())
            }
            AppError::Multipart(error) => (error.status(), error.body_text()),
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                format!("missing or invalid {} header", USER_HEADER),
            ),
            AppError::NotFoundError(error) => {
                (StatusCode::NOT_FOUND, format!("Not found: {}", error))
            }
            AppError::InternalServerError(error) => {
                tracing::error!("Internal Server Error: {}", error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many batches queued, try again later".to_string(),
            ),
        };

        (status, AppJson(ErrorResponse { message })).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::JsonRejection(rejection)
    }
}

impl From<MultipartError> for AppError {
    fn from(error: MultipartError) -> Self {
        Self::Multipart(error)
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ProcessNotFound(_) | StoreError::WebhookNotFound(_) => {
                Self::NotFoundError(error.into())
            }
            _ => Self::InternalServerError(error.into()),
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::QueueFull => Self::TooManyRequests,
            SubmitError::Store(error) => error.into(),
            SubmitError::RunnerStopped => Self::InternalServerError(error.into()),
        }
    }
}

pub async fn health_check() -> &'static str {
    "ok"
}

/// Ping
///
/// Liveness check used by the dashboard.
#[utoipa::path(
    get,
    path = "/api/ping",
    responses((status = OK, body = String)),
    tag = "Server"
)]
pub async fn ping() -> &'static str {
    "pong"
}

pub async fn banner() -> &'static str {
    "batch-label: bulk image labelling service"
}

#[derive(OpenApi)]
#[openapi(
    paths(
        ping,
        process::submit,
        process::list,
        process::detail,
        webhook::create,
        webhook::list,
        webhook::detail,
        webhook::update,
        webhook::remove,
        webhook::events,
    ),
    components(schemas(
        crate::store::models::Process,
        crate::store::models::ProcessStatus,
        crate::store::models::Webhook,
        crate::store::models::WebhookMethod,
        crate::store::models::WebhookEvent,
        process::UploadImages,
        process::ProcessResponse,
        webhook::CreateWebhook,
        webhook::UpdateWebhook,
        webhook::WebhookResponse,
    )),
    tags(
        (name = "Process", description = "Batch submission and status"),
        (name = "Webhook", description = "Completion webhooks and their delivery log"),
    )
)]
pub struct ApiDoc;
