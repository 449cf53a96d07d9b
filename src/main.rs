//! darkroom - HTTP image-processing gateway

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use darkroom::config::Args;
use darkroom::{server, Cx};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("darkroom={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = args.validate() {
        error!("configuration error: {}", err);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  darkroom {}", server::VERSION);
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.unsafe_mode {
            "UNSAFE (unsigned URLs accepted)"
        } else {
            "signed"
        }
    );
    info!(
        "Timeouts: request={}ms load={}ms save={}ms process={}ms",
        args.request_timeout_ms, args.load_timeout_ms, args.save_timeout_ms, args.process_timeout_ms
    );
    if let Some(dir) = &args.file_storage_dir {
        info!("Source cache: {}", dir.display());
    }
    if let Some(dir) = &args.result_storage_dir {
        info!("Result cache: {}", dir.display());
    }
    info!("======================================");

    let app = args.build_gateway();
    app.startup(&Cx::root()).await?;

    let serve = server::run(Arc::clone(&app), args.listen);
    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                error!("server error: {:?}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    if let Err(err) = app.shutdown(&Cx::root()).await {
        warn!("shutdown error: {}", err);
    }
    Ok(())
}
