use super::{
    output::OutputLayout,
    pipeline::{BatchJob, BatchPipeline},
};
use crate::store::{
    models::{NewProcess, Process},
    Store, StoreError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("batch queue is full")]
    QueueFull,
    #[error("batch runner has stopped")]
    RunnerStopped,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Accepts batches and feeds them to a background runner.
#[derive(Clone, Debug)]
pub struct BatchQueue {
    tx: mpsc::Sender<BatchJob>,
    store: Arc<dyn Store>,
    layout: Arc<OutputLayout>,
}

impl BatchQueue {
    /// Spawn the runner. At most `concurrency` batches run at once and at most
    /// `capacity` more wait in the queue.
    pub fn start(
        pipeline: Arc<BatchPipeline>,
        store: Arc<dyn Store>,
        layout: Arc<OutputLayout>,
        capacity: usize,
        concurrency: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_batches(pipeline, rx, concurrency.max(1)));

        Self { tx, store, layout }
    }

    /// Create the process record and enqueue its images. The record is returned
    /// as soon as it is stored; processing happens in the background.
    /// `origin` prefixes image URLs when no public URL is configured.
    pub async fn submit(
        &self,
        owner_id: u64,
        images: Vec<Vec<u8>>,
        origin: Option<String>,
    ) -> Result<Process, SubmitError> {
        // reserve first so a full queue never leaves a record stuck in `processing`
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::RunnerStopped,
        })?;

        let created_at = self.layout.next_creation_time();
        let process = self
            .store
            .create_process(NewProcess {
                created_by_id: owner_id,
                image_amount: images.len(),
                output_url: OutputLayout::output_url(&created_at),
                created_at,
            })
            .await?;

        tracing::info!(
            "process {} accepted with {} images",
            process.id,
            images.len()
        );
        permit.send(BatchJob {
            process_id: process.id,
            images,
            origin,
        });

        Ok(process)
    }
}

async fn run_batches(
    pipeline: Arc<BatchPipeline>,
    mut rx: mpsc::Receiver<BatchJob>,
    concurrency: usize,
) {
    let slots = Arc::new(Semaphore::new(concurrency));

    loop {
        let Ok(slot) = slots.clone().acquire_owned().await else {
            break;
        };
        let Some(job) = rx.recv().await else {
            break;
        };

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(job).await;
            drop(slot);
        });
    }

    tracing::info!("batch runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::{dispatch::tests::FakeTransformer, dispatch::Dispatcher},
        store::{
            models::{NewWebhook, ProcessStatus, WebhookMethod},
            record::RecordStore,
        },
        webhook::WebhookNotifier,
    };
    use serde_json::Value;
    use std::{path::Path, time::Duration};
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    fn start_queue(
        store: Arc<RecordStore>,
        output_root: &Path,
        transformer: FakeTransformer,
    ) -> (BatchQueue, Arc<OutputLayout>) {
        let layout = Arc::new(OutputLayout::new(output_root, ""));
        let pipeline = Arc::new(BatchPipeline::new(
            store.clone(),
            Dispatcher::new(Arc::new(transformer), 2),
            WebhookNotifier::new(store.clone()),
            layout.clone(),
        ));
        let queue = BatchQueue::start(pipeline, store, layout.clone(), 8, 2);
        (queue, layout)
    }

    async fn wait_for_terminal(store: &RecordStore, id: u64) -> Process {
        for _ in 0..500 {
            let process = store.get_process(id).await.unwrap().unwrap();
            if process.status.is_terminal() {
                return process;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {} never finished", id);
    }

    fn images(n: usize) -> Vec<Vec<u8>> {
        (1..=n).map(|i| vec![i as u8; 4]).collect()
    }

    #[tokio::test]
    async fn submit_returns_processing_record_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let (queue, _) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let process = queue.submit(1, images(3), None).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Processing);
        assert_eq!(process.image_amount, 3);
        assert!(process.output_url.starts_with("/output/process_"));

        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);
        assert!(done.finished_processing_at.is_some());
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let (queue, _) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let process = queue.submit(1, vec![], None).await.unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);
        assert_eq!(done.image_amount, 0);
    }

    #[tokio::test]
    async fn partial_failures_keep_amount_and_skip_urls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        store
            .create_webhook(NewWebhook {
                owner_id: 5,
                label: "done".to_string(),
                url: server.uri().parse().unwrap(),
                method: WebhookMethod::Post,
                request_config: None,
            })
            .await
            .unwrap();
        let (queue, layout) =
            start_queue(store.clone(), dir.path(), FakeTransformer::failing(&[2, 4]));

        let process = queue
            .submit(5, images(5), Some("http://labels.test".to_string()))
            .await
            .unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);
        assert_eq!(done.image_amount, 5);

        let on_disk = layout
            .list_images(&layout.process_dir(&done.output_url))
            .await
            .unwrap();
        assert_eq!(on_disk, vec![1, 3, 5]);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["imageAmount"], 5);
        assert_eq!(body["status"], "completed");
        let urls: Vec<&str> = body["imageUrls"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            urls,
            vec![
                format!("http://labels.test{}/image_1.png", done.output_url),
                format!("http://labels.test{}/image_3.png", done.output_url),
                format!("http://labels.test{}/image_5.png", done.output_url),
            ]
        );
    }

    #[tokio::test]
    async fn owner_without_webhooks_triggers_no_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        // belongs to someone else
        let foreign = store
            .create_webhook(NewWebhook {
                owner_id: 2,
                label: "other".to_string(),
                url: server.uri().parse().unwrap(),
                method: WebhookMethod::Post,
                request_config: None,
            })
            .await
            .unwrap();
        let (queue, _) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let process = queue.submit(1, images(2), None).await.unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);

        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(store
            .list_webhook_events(foreign.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unwritable_record_rejects_without_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let record_dir = tempfile::tempdir().unwrap();
        // a directory cannot be written as a record file
        let store = Arc::new(RecordStore::open(record_dir.path()).await);
        let (queue, _) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let err = queue.submit(1, images(1), None).await.unwrap_err();
        assert!(matches!(err, SubmitError::Store(_)));
        assert!(store.list_processes(1).await.unwrap().is_empty());
        assert!(store.get_process(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_image_failing_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let (queue, _) =
            start_queue(store.clone(), dir.path(), FakeTransformer::failing(&[1, 2]));

        let process = queue.submit(1, images(2), None).await.unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.image_amount, 2);
    }

    #[tokio::test]
    async fn unusable_output_root_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"x").unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let (queue, _) = start_queue(store.clone(), &root, FakeTransformer::default());

        let process = queue.submit(1, images(1), None).await.unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn unreachable_webhook_still_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let mut hooks = vec![];
        for url in [server.uri(), "http://127.0.0.1:1/down".to_string()] {
            hooks.push(
                store
                    .create_webhook(NewWebhook {
                        owner_id: 3,
                        label: url.clone(),
                        url: url.parse().unwrap(),
                        method: WebhookMethod::Post,
                        request_config: None,
                    })
                    .await
                    .unwrap(),
            );
        }
        let (queue, _) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let process = queue.submit(3, images(2), None).await.unwrap();
        let done = wait_for_terminal(&store, process.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);

        let mut statuses = vec![];
        for hook in &hooks {
            let events = store.list_webhook_events(hook.id).await.unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].process_id, process.id);
            statuses.push(events[0].response_status);
        }
        assert_eq!(statuses, vec![204, 500]);
    }

    #[tokio::test]
    async fn concurrent_batches_use_disjoint_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory());
        let (queue, layout) = start_queue(store.clone(), dir.path(), FakeTransformer::default());

        let (first, second) = tokio::join!(
            queue.submit(1, vec![b"alice".to_vec()], None),
            queue.submit(2, vec![b"bob".to_vec()], None)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.output_url, second.output_url);

        wait_for_terminal(&store, first.id).await;
        wait_for_terminal(&store, second.id).await;

        let alice = std::fs::read(layout.process_dir(&first.output_url).join("image_1.png"));
        let bob = std::fs::read(layout.process_dir(&second.output_url).join("image_1.png"));
        assert_eq!(alice.unwrap(), b"alice");
        assert_eq!(bob.unwrap(), b"bob");
    }

    #[tokio::test]
    async fn full_queue_rejects_without_creating_record() {
        let store = Arc::new(RecordStore::in_memory());
        let layout = Arc::new(OutputLayout::new("unused", ""));
        // no runner drains this channel
        let (tx, _rx) = mpsc::channel(1);
        let queue = BatchQueue {
            tx,
            store: store.clone(),
            layout,
        };

        queue.submit(1, vec![], None).await.unwrap();
        let err = queue.submit(1, vec![], None).await.unwrap_err();
        assert!(matches!(err, SubmitError::QueueFull));
        assert_eq!(store.list_processes(1).await.unwrap().len(), 1);
    }
}
