use super::{
    dispatch::{DispatchError, Dispatcher},
    output::OutputLayout,
};
use crate::{
    store::{models::ProcessStatus, Store, StoreError},
    webhook::{CompletionPayload, WebhookNotifier},
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("process {0} disappeared before it could run")]
    ProcessNotFound(u64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Work handed from a submission to the background runner.
#[derive(Debug)]
pub struct BatchJob {
    pub process_id: u64,
    pub images: Vec<Vec<u8>>,
    /// Origin of the submitting request, e.g. `http://localhost:5000`.
    pub origin: Option<String>,
}

#[derive(Debug)]
struct BatchSummary {
    status: ProcessStatus,
    labelled: usize,
    verified: bool,
}

/// Everything that happens to a process after it was accepted.
#[derive(Debug)]
pub struct BatchPipeline {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    notifier: WebhookNotifier,
    layout: Arc<OutputLayout>,
}

impl BatchPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        notifier: WebhookNotifier,
        layout: Arc<OutputLayout>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            layout,
        }
    }

    /// Run a job to a terminal status. Errors are logged and turn the process
    /// into `failed`.
    #[tracing::instrument(skip_all, fields(process_id = job.process_id, images = job.images.len()))]
    pub async fn run(&self, job: BatchJob) {
        let process_id = job.process_id;

        match self.process(job).await {
            Ok(summary) => tracing::info!(
                "process finished: {:?}, {} images labelled, output {}",
                summary.status,
                summary.labelled,
                if summary.verified {
                    "matches outcomes"
                } else {
                    "differs from outcomes"
                }
            ),
            Err(e) => {
                tracing::error!("process aborted: {}", e);
                if let Err(e) = self
                    .store
                    .finish_process(process_id, ProcessStatus::Failed, Utc::now())
                    .await
                {
                    tracing::error!("failed to mark process as failed: {}", e);
                }
            }
        }
    }

    async fn process(&self, job: BatchJob) -> Result<BatchSummary, BatchError> {
        let process = self
            .store
            .get_process(job.process_id)
            .await?
            .ok_or(BatchError::ProcessNotFound(job.process_id))?;
        let webhooks = self.store.list_webhooks(process.created_by_id).await?;

        let output_dir = self.layout.process_dir(&process.output_url);
        let outcomes = self.dispatcher.dispatch(job.images, &output_dir).await?;

        let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
        if !failed.is_empty() {
            tracing::warn!(
                "{} of {} images failed: {:?}",
                failed.len(),
                outcomes.len(),
                failed
            );
        }

        let verified = self.layout.verify(&output_dir, &outcomes).await;
        let image_urls = self
            .layout
            .image_urls(job.origin.as_deref(), &process.output_url, &outcomes);

        let status = if !outcomes.is_empty() && failed.len() == outcomes.len() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
        let finished_at = Utc::now();

        if !webhooks.is_empty() {
            let payload = CompletionPayload {
                process_id: process.id,
                status,
                image_urls,
                image_amount: process.image_amount,
                finished_processing_at: finished_at,
            };
            self.notifier.notify(&webhooks, &payload).await;
        }

        self.store
            .finish_process(process.id, status, finished_at)
            .await?;

        Ok(BatchSummary {
            status,
            labelled: outcomes.len() - failed.len(),
            verified,
        })
    }
}
