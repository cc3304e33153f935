use crate::{
    batch::{
        dispatch::Dispatcher,
        output::OutputLayout,
        pipeline::BatchPipeline,
        queue::BatchQueue,
        transform::{CommandTransformer, ImageTransformer},
    },
    config::AppConfig,
    store::{record::RecordStore, Store},
    webhook::WebhookNotifier,
};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct AppState {
    config: AppConfig,
    store: Arc<dyn Store>,
    layout: Arc<OutputLayout>,
    batch_queue: BatchQueue,
}

impl AppState {
    /// Build the state from config, labelling images with the configured tool.
    /// Must be called inside a tokio runtime; the batch runner is spawned here.
    pub async fn new(config: AppConfig) -> Self {
        let store: Arc<dyn Store> = match &config.record_path {
            Some(record_path) => Arc::new(RecordStore::open(record_path).await),
            None => Arc::new(RecordStore::in_memory()),
        };
        let transformer = Arc::new(CommandTransformer::new(&config.transform_tool));

        Self::with_parts(config, store, transformer)
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn Store>,
        transformer: Arc<dyn ImageTransformer>,
    ) -> Self {
        let layout = Arc::new(OutputLayout::new(
            config.output_root.clone(),
            config.public_url.clone(),
        ));
        let dispatcher = Dispatcher::new(transformer, config.worker_count());
        tracing::info!("dispatching with {} workers per batch", dispatcher.workers());

        let pipeline = Arc::new(BatchPipeline::new(
            store.clone(),
            dispatcher,
            WebhookNotifier::new(store.clone()),
            layout.clone(),
        ));
        let batch_queue = BatchQueue::start(
            pipeline,
            store.clone(),
            layout.clone(),
            config.batch_queue_limit,
            config.batch_concurrency,
        );

        Self {
            config,
            store,
            layout,
            batch_queue,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn layout(&self) -> Arc<OutputLayout> {
        self.layout.clone()
    }

    pub fn batch_queue(&self) -> &BatchQueue {
        &self.batch_queue
    }
}
