use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil_server::config::EngineConfig;
use vigil_server::engine::Engine;
use vigil_server::notifier::LogNotifier;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    // The chat front-end owns the token; the engine only verifies the
    // deployment is complete enough to run.
    let token_present = std::env::var("TELEGRAM_TOKEN")
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false);
    if !token_present {
        error!("TELEGRAM_TOKEN is not set; refusing to start");
        return ExitCode::from(2);
    }

    let config = EngineConfig::from_env();
    let engine = match Engine::start(config, Arc::new(LogNotifier)).await {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "engine startup failed");
            return ExitCode::FAILURE;
        }
    };

    info!("vigil engine running; press ctrl-c to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "signal listener failed");
    }
    engine.shutdown().await;
    info!("clean shutdown");
    ExitCode::SUCCESS
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
