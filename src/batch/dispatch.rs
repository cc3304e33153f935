use super::transform::{ImageJob, ImageTransformer};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinSet};
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutcome {
    pub image_number: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageOutcome {
    pub fn success(image_number: usize) -> Self {
        Self {
            image_number,
            success: true,
            error: None,
        }
    }

    pub fn failure(image_number: usize, error: impl Into<String>) -> Self {
        Self {
            image_number,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Runs the transformer over a batch on a fixed pool of workers.
///
/// Workers are long-lived for the duration of one dispatch and pull jobs from a
/// bounded queue, so a slow image only holds up its own worker.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    transformer: Arc<dyn ImageTransformer>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(transformer: Arc<dyn ImageTransformer>, workers: usize) -> Self {
        Self {
            transformer,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Transform every image into `output_dir`, returning one outcome per image
    /// ordered by image number.
    pub async fn dispatch(
        &self,
        images: Vec<Vec<u8>>,
        output_dir: &Path,
    ) -> Result<Vec<ImageOutcome>, DispatchError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| DispatchError::OutputDir {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let total = images.len();
        if total == 0 {
            return Ok(vec![]);
        }

        let width = self.workers.min(total);
        tracing::debug!("dispatching {} images to {} workers", total, width);

        let (job_tx, job_rx) = async_channel::bounded::<ImageJob>(width);
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ImageOutcome>();

        let mut workers = JoinSet::new();
        for worker_id in 0..width {
            workers.spawn(run_worker(
                worker_id,
                job_rx.clone(),
                outcome_tx.clone(),
                self.transformer.clone(),
            ));
        }
        drop(job_rx);
        drop(outcome_tx);

        for (index, data) in images.into_iter().enumerate() {
            let job = ImageJob::new(index + 1, data, output_dir);
            if job_tx.send(job).await.is_err() {
                tracing::warn!("all workers stopped, {} images left unqueued", total - index);
                break;
            }
        }
        job_tx.close();

        // release the pool
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("worker stopped unexpectedly: {}", e);
            }
        }

        let mut outcomes = BTreeMap::new();
        while let Some(outcome) = outcome_rx.recv().await {
            outcomes.insert(outcome.image_number, outcome);
        }

        Ok((1..=total)
            .map(|number| {
                outcomes.remove(&number).unwrap_or_else(|| {
                    ImageOutcome::failure(number, "image was not processed by any worker")
                })
            })
            .collect())
    }
}

async fn run_worker(
    worker_id: usize,
    jobs: async_channel::Receiver<ImageJob>,
    outcomes: mpsc::UnboundedSender<ImageOutcome>,
    transformer: Arc<dyn ImageTransformer>,
) {
    while let Ok(job) = jobs.recv().await {
        let number = job.number;
        let transformer = transformer.clone();

        // a panicking transform must not take the worker with it
        let unit = tokio::spawn(async move { transformer.transform(&job).await });
        let outcome = match unit.await {
            Ok(Ok(())) => ImageOutcome::success(number),
            Ok(Err(e)) => {
                tracing::debug!("worker {} failed image {}: {}", worker_id, number, e);
                ImageOutcome::failure(number, e.to_string())
            }
            Err(e) => ImageOutcome::failure(number, format!("transform aborted: {}", e)),
        };

        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}
