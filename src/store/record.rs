use super::{
    models::{
        NewProcess, NewWebhook, NewWebhookEvent, Process, ProcessStatus, Webhook, WebhookChanges,
        WebhookEvent,
    },
    Store, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;

/// In-memory [`Store`], optionally mirrored to a JSON record file after every mutation.
#[derive(Debug)]
pub struct RecordStore {
    inner: RwLock<InnerState>,
    record_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct InnerState {
    processes: BTreeMap<u64, Process>,
    webhooks: BTreeMap<u64, Webhook>,
    webhook_events: Vec<WebhookEvent>,
    last_process_id: u64,
    last_webhook_id: u64,
    last_event_id: u64,
}

impl InnerState {
    /// Rewrites the whole record, so each mutation costs O(size of the record).
    async fn dump(&self, record_path: Option<&Path>) -> Result<(), StoreError> {
        if let Some(record_path) = record_path {
            if let Some(parent) = record_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json_str = serde_json::to_string(self)?;
            tokio::fs::write(record_path, json_str).await?;
        }
        Ok(())
    }
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(InnerState::default()),
            record_path: None,
        }
    }

    /// Load the record file if it exists. An unreadable record starts empty.
    pub async fn open(record_path: impl AsRef<Path>) -> Self {
        let record_path = record_path.as_ref();
        let inner_state = if record_path.exists() {
            let json_str = tokio::fs::read_to_string(record_path)
                .await
                .unwrap_or_default();
            match serde_json::from_str(&json_str) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        "ignoring unreadable record {}: {}",
                        record_path.display(),
                        e
                    );
                    InnerState::default()
                }
            }
        } else {
            InnerState::default()
        };

        Self {
            inner: RwLock::new(inner_state),
            record_path: Some(record_path.to_path_buf()),
        }
    }

    fn record_path(&self) -> Option<&Path> {
        self.record_path.as_deref()
    }

    /// Persist `next` and only then make it the live state. A failed write
    /// leaves memory and record file unchanged.
    async fn commit(&self, state: &mut InnerState, next: InnerState) -> Result<(), StoreError> {
        next.dump(self.record_path()).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl Store for RecordStore {
    async fn create_process(&self, process: NewProcess) -> Result<Process, StoreError> {
        let mut state = self.inner.write().await;
        let mut next = state.clone();
        next.last_process_id += 1;

        let process = Process {
            id: next.last_process_id,
            created_by_id: process.created_by_id,
            image_amount: process.image_amount,
            output_url: process.output_url,
            status: ProcessStatus::Processing,
            created_at: process.created_at,
            finished_processing_at: None,
        };
        next.processes.insert(process.id, process.clone());
        self.commit(&mut state, next).await?;

        Ok(process)
    }

    async fn get_process(&self, id: u64) -> Result<Option<Process>, StoreError> {
        Ok(self.inner.read().await.processes.get(&id).cloned())
    }

    async fn list_processes(&self, owner_id: u64) -> Result<Vec<Process>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .processes
            .values()
            .rev()
            .filter(|p| p.created_by_id == owner_id)
            .cloned()
            .collect())
    }

    async fn finish_process(
        &self,
        id: u64,
        status: ProcessStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let mut state = self.inner.write().await;
        let current = state
            .processes
            .get(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;

        // a process leaves `processing` once
        if current.status.is_terminal() {
            return Ok(current.clone());
        }
        let process = Process {
            status,
            finished_processing_at: Some(finished_at),
            ..current.clone()
        };
        let mut next = state.clone();
        next.processes.insert(id, process.clone());
        self.commit(&mut state, next).await?;

        Ok(process)
    }

    async fn create_webhook(&self, webhook: NewWebhook) -> Result<Webhook, StoreError> {
        let mut state = self.inner.write().await;
        let mut next = state.clone();
        next.last_webhook_id += 1;

        let webhook = Webhook {
            id: next.last_webhook_id,
            owner_id: webhook.owner_id,
            label: webhook.label,
            url: webhook.url,
            method: webhook.method,
            request_config: webhook.request_config,
            created_at: Utc::now(),
        };
        next.webhooks.insert(webhook.id, webhook.clone());
        self.commit(&mut state, next).await?;

        Ok(webhook)
    }

    async fn get_webhook(&self, id: u64) -> Result<Option<Webhook>, StoreError> {
        Ok(self.inner.read().await.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self, owner_id: u64) -> Result<Vec<Webhook>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .webhooks
            .values()
            .filter(|w| w.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn update_webhook(
        &self,
        id: u64,
        changes: WebhookChanges,
    ) -> Result<Webhook, StoreError> {
        let mut state = self.inner.write().await;
        let mut next = state.clone();
        let webhook = next
            .webhooks
            .get_mut(&id)
            .ok_or(StoreError::WebhookNotFound(id))?;

        if let Some(label) = changes.label {
            webhook.label = label;
        }
        if let Some(url) = changes.url {
            webhook.url = url;
        }
        if let Some(method) = changes.method {
            webhook.method = method;
        }
        if let Some(request_config) = changes.request_config {
            webhook.request_config = request_config;
        }
        let webhook = webhook.clone();
        self.commit(&mut state, next).await?;

        Ok(webhook)
    }

    async fn delete_webhook(&self, id: u64) -> Result<bool, StoreError> {
        let mut state = self.inner.write().await;
        let mut next = state.clone();
        let removed = next.webhooks.remove(&id).is_some();
        if removed {
            self.commit(&mut state, next).await?;
        }
        Ok(removed)
    }

    async fn create_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<WebhookEvent, StoreError> {
        let mut state = self.inner.write().await;
        let mut next = state.clone();
        next.last_event_id += 1;

        let event = WebhookEvent {
            id: next.last_event_id,
            webhook_id: event.webhook_id,
            process_id: event.process_id,
            request: event.request,
            response: event.response,
            response_status: event.response_status,
            created_at: Utc::now(),
        };
        next.webhook_events.push(event.clone());
        self.commit(&mut state, next).await?;

        Ok(event)
    }

    async fn list_webhook_events(&self, webhook_id: u64) -> Result<Vec<WebhookEvent>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .webhook_events
            .iter()
            .rev()
            .filter(|e| e.webhook_id == webhook_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::WebhookMethod;
    use serde_json::json;

    fn new_process(owner: u64, images: usize, stamp: i64) -> NewProcess {
        NewProcess {
            created_by_id: owner,
            image_amount: images,
            output_url: format!("/output/process_{}", stamp),
            created_at: Utc::now(),
        }
    }

    fn new_webhook(owner: u64) -> NewWebhook {
        NewWebhook {
            owner_id: owner,
            label: "ci".to_string(),
            url: "http://localhost:9000/hook".parse().unwrap(),
            method: WebhookMethod::Post,
            request_config: None,
        }
    }

    #[tokio::test]
    async fn process_finishes_only_once() {
        let store = RecordStore::in_memory();
        let process = store.create_process(new_process(1, 3, 1)).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Processing);
        assert!(process.finished_processing_at.is_none());

        let first = Utc::now();
        let done = store
            .finish_process(process.id, ProcessStatus::Completed, first)
            .await
            .unwrap();
        assert_eq!(done.status, ProcessStatus::Completed);
        assert_eq!(done.finished_processing_at, Some(first));

        let again = store
            .finish_process(process.id, ProcessStatus::Failed, Utc::now())
            .await
            .unwrap();
        assert_eq!(again.status, ProcessStatus::Completed);
        assert_eq!(again.finished_processing_at, Some(first));
    }

    #[tokio::test]
    async fn finishing_unknown_process_is_an_error() {
        let store = RecordStore::in_memory();
        let err = store
            .finish_process(42, ProcessStatus::Completed, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ProcessNotFound(42)));
    }

    #[tokio::test]
    async fn listings_are_scoped_to_owner() {
        let store = RecordStore::in_memory();
        store.create_process(new_process(1, 1, 1)).await.unwrap();
        store.create_process(new_process(2, 1, 2)).await.unwrap();
        let newest = store.create_process(new_process(1, 2, 3)).await.unwrap();
        store.create_webhook(new_webhook(1)).await.unwrap();
        store.create_webhook(new_webhook(2)).await.unwrap();

        let processes = store.list_processes(1).await.unwrap();
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].id, newest.id);
        assert_eq!(store.list_webhooks(1).await.unwrap().len(), 1);
        assert!(store.list_webhooks(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_partial_update_and_delete_keep_events() {
        let store = RecordStore::in_memory();
        let webhook = store.create_webhook(new_webhook(1)).await.unwrap();

        let updated = store
            .update_webhook(
                webhook.id,
                WebhookChanges {
                    label: Some("deploy".to_string()),
                    request_config: Some(Some(json!({ "headers": { "x-token": "abc" } }))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.label, "deploy");
        assert_eq!(updated.method, WebhookMethod::Post);
        assert!(updated.request_config.is_some());

        store
            .create_webhook_event(NewWebhookEvent {
                webhook_id: webhook.id,
                process_id: 7,
                request: json!({}),
                response: json!({ "ok": true }),
                response_status: 200,
            })
            .await
            .unwrap();

        assert!(store.delete_webhook(webhook.id).await.unwrap());
        assert!(!store.delete_webhook(webhook.id).await.unwrap());
        assert_eq!(store.list_webhook_events(webhook.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("nested").join("record.json");

        let store = RecordStore::open(&record_path).await;
        let process = store.create_process(new_process(9, 4, 10)).await.unwrap();
        store.create_webhook(new_webhook(9)).await.unwrap();
        drop(store);

        let reopened = RecordStore::open(&record_path).await;
        let loaded = reopened.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(loaded.image_amount, 4);
        assert_eq!(loaded.output_url, process.output_url);
        assert_eq!(reopened.list_webhooks(9).await.unwrap().len(), 1);

        let next = reopened.create_process(new_process(9, 1, 11)).await.unwrap();
        assert_eq!(next.id, process.id + 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_record_behind() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be written as a record file
        let store = RecordStore::open(dir.path()).await;

        let err = store.create_process(new_process(1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.get_process(1).await.unwrap().is_none());
        assert!(store.list_processes(1).await.unwrap().is_empty());
        assert!(store.create_webhook(new_webhook(1)).await.is_err());
        assert!(store.list_webhooks(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_status() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("record.json");
        let store = RecordStore::open(&record_path).await;
        let process = store.create_process(new_process(1, 2, 1)).await.unwrap();

        std::fs::remove_file(&record_path).unwrap();
        std::fs::create_dir(&record_path).unwrap();

        assert!(store
            .finish_process(process.id, ProcessStatus::Completed, Utc::now())
            .await
            .is_err());
        let current = store.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessStatus::Processing);
        assert!(current.finished_processing_at.is_none());
    }
}
