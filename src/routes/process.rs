use super::{AppError, AppJson, Owner};
use crate::{
    batch::{output::OutputLayout, transform::image_file_name},
    state::AppState,
    store::models::{Process, ProcessStatus},
};
use axum::{
    extract::{Host, Multipart, Path, State},
    http::HeaderMap,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

const OPENAPI_TAG: &str = "Process";

/// `scheme://host` the request was addressed to, honouring `x-forwarded-proto`.
fn request_origin(host: &str, headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{}://{}", scheme, host)
}

/// Multipart body of a batch submission.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct UploadImages {
    #[schema(value_type = Vec<String>, format = Binary)]
    images: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub id: u64,
    pub created_by_id: u64,
    pub image_amount: usize,
    pub output_url: String,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub finished_processing_at: Option<DateTime<Utc>>,
    pub image_urls: Vec<String>,
}

impl ProcessResponse {
    fn new(process: Process, image_urls: Vec<String>) -> Self {
        Self {
            id: process.id,
            created_by_id: process.created_by_id,
            image_amount: process.image_amount,
            output_url: process.output_url,
            status: process.status,
            created_at: process.created_at,
            finished_processing_at: process.finished_processing_at,
            image_urls,
        }
    }
}

/// Submit batch
///
/// Upload images as multipart file fields (conventionally named `images`).
/// The process is created immediately and labelled in the background.
#[utoipa::path(
    post,
    path = "/api/process",
    request_body(content = UploadImages, content_type = "multipart/form-data"),
    params(("x-user-id" = u64, Header, description = "Owner id")),
    responses(
        (status = OK, body = Process),
        (status = TOO_MANY_REQUESTS, description = "Batch queue is full.", body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn submit(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Host(host): Host,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<AppJson<Process>, AppError> {
    let mut images = vec![];
    while let Some(field) = multipart.next_field().await? {
        // plain text fields carry no image
        if field.file_name().is_none() && field.name() != Some("images") {
            continue;
        }
        images.push(field.bytes().await?.to_vec());
    }

    let origin = request_origin(&host, &headers);
    let process = app_state
        .batch_queue()
        .submit(owner_id, images, Some(origin))
        .await?;

    Ok(AppJson(process))
}

/// List processes
///
/// All processes of the caller, newest first.
#[utoipa::path(
    get,
    path = "/api/process",
    params(("x-user-id" = u64, Header, description = "Owner id")),
    responses((status = OK, body = Vec<Process>)),
    tag = OPENAPI_TAG
)]
pub async fn list(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
) -> Result<AppJson<Vec<Process>>, AppError> {
    let processes = app_state.store().list_processes(owner_id).await?;
    Ok(AppJson(processes))
}

/// Check process
///
/// Status of one process together with the images found in its output directory.
#[utoipa::path(
    get,
    path = "/api/process/{id}",
    params(
        ("id" = u64, Path, description = "Process id"),
        ("x-user-id" = u64, Header, description = "Owner id"),
    ),
    responses(
        (status = OK, body = ProcessResponse),
        (status = NOT_FOUND, description = "Process not found.", body = String),
    ),
    tag = OPENAPI_TAG
)]
pub async fn detail(
    State(app_state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Host(host): Host,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<AppJson<ProcessResponse>, AppError> {
    let process = app_state
        .store()
        .get_process(id)
        .await?
        .filter(|p| p.created_by_id == owner_id)
        .ok_or_else(|| AppError::NotFoundError(anyhow::anyhow!("process not found")))?;

    let layout = app_state.layout();
    let origin = request_origin(&host, &headers);
    let base_url = layout.base_url(Some(&origin));
    let image_urls = layout
        .list_images(&layout.process_dir(&process.output_url))
        .await
        .map_err(|e| AppError::InternalServerError(e.into()))?
        .into_iter()
        .map(|number| {
            OutputLayout::image_url(base_url, &process.output_url, &image_file_name(number))
        })
        .collect();

    Ok(AppJson(ProcessResponse::new(process, image_urls)))
}

pub fn process_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list).post(submit))
        .route("/:id", get(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn origin_follows_forwarded_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            request_origin("labels.test:5000", &headers),
            "http://labels.test:5000"
        );

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(request_origin("labels.test", &headers), "https://labels.test");
    }
}
