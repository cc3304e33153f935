pub mod models;
pub mod record;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use models::{
    NewProcess, NewWebhook, NewWebhookEvent, Process, ProcessStatus, Webhook, WebhookChanges,
    WebhookEvent,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("process {0} not found")]
    ProcessNotFound(u64),
    #[error("webhook {0} not found")]
    WebhookNotFound(u64),
    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persistence contract used by the pipeline and the HTTP layer.
///
/// The pipeline only creates and updates processes, reads webhooks and appends
/// webhook events. Webhook mutation is reserved for the owner-facing routes.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn create_process(&self, process: NewProcess) -> Result<Process, StoreError>;

    async fn get_process(&self, id: u64) -> Result<Option<Process>, StoreError>;

    /// Processes created by `owner_id`, newest first.
    async fn list_processes(&self, owner_id: u64) -> Result<Vec<Process>, StoreError>;

    async fn finish_process(
        &self,
        id: u64,
        status: ProcessStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<Process, StoreError>;

    async fn create_webhook(&self, webhook: NewWebhook) -> Result<Webhook, StoreError>;

    async fn get_webhook(&self, id: u64) -> Result<Option<Webhook>, StoreError>;

    async fn list_webhooks(&self, owner_id: u64) -> Result<Vec<Webhook>, StoreError>;

    async fn update_webhook(
        &self,
        id: u64,
        changes: WebhookChanges,
    ) -> Result<Webhook, StoreError>;

    /// Returns `true` if a webhook was removed. Its events are kept.
    async fn delete_webhook(&self, id: u64) -> Result<bool, StoreError>;

    async fn create_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<WebhookEvent, StoreError>;

    /// Events of one webhook, newest first.
    async fn list_webhook_events(&self, webhook_id: u64) -> Result<Vec<WebhookEvent>, StoreError>;
}
