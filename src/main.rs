use batch_label::config::AppConfig;
use batch_label::run;
use batch_label::state::AppState;
use tracing::{debug, error, info};

#[cfg(debug_assertions)]
use dotenv::dotenv;

#[tokio::main]
async fn main() {
    #[cfg(debug_assertions)]
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env();
    debug!("config: {:?}", config);
    info!(
        "labelling with `{}`, output under {}",
        config.transform_tool,
        config.output_root.display()
    );
    let state = AppState::new(config).await;

    if let Err(e) = run(state).await {
        error!("failed to start app: {}", e);
    }
}
