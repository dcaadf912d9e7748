use std::net::SocketAddr;

use kitsunegram::{
    config::Config,
    error::ApiError,
    server::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "kitsunegram=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    let state = AppState::from_config(&config)
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?;
    state.retention().sweep_stale().await;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address.");
    }
    info!(
        "Retaining downloads in {:?} for {} seconds, credentials from {}",
        state.retention().root(),
        state.retention().retention().as_secs(),
        state.credentials().describe()
    );

    let app = server::router(state, &config)?;

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("KitsuneGram listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
