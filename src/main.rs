use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, response::Json, routing::get, Router};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use order_edit_api as api;

use api::gateway::{AuthorizationGateway, HttpAuthorizationGateway};
use api::queue::{CaptureQueue, InMemoryCaptureQueue, RedisCaptureQueue};
use api::services::reconciliation::{run_scheduler, ReconciliationJob};
use api::services::saga::OrderModificationService;
use api::store::{OrderStore, SqlOrderStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db = Arc::new(api::db::establish_connection_from_app_config(&cfg).await?);

    // Init events
    let (event_sender, event_rx) = api::events::channel();
    tokio::spawn(api::events::process_events(event_rx));

    // One gateway client and one queue connection per process; both are
    // constructed here and injected, never looked up globally.
    let gateway: Arc<dyn AuthorizationGateway> = Arc::new(HttpAuthorizationGateway::new(
        cfg.gateway_url()?,
        cfg.gateway_secret_key.clone(),
        cfg.retry_config(),
    ));

    let queue: Arc<dyn CaptureQueue> = match cfg.queue_backend.to_ascii_lowercase().as_str() {
        "redis" => match redis::Client::open(cfg.redis_url.clone()) {
            Ok(client) => Arc::new(RedisCaptureQueue::new(
                Arc::new(client),
                cfg.queue_namespace.clone(),
            )),
            Err(err) => {
                error!(
                    "Failed to initialize Redis capture queue (falling back to in-memory): {}",
                    err
                );
                Arc::new(InMemoryCaptureQueue::new())
            }
        },
        _ => Arc::new(InMemoryCaptureQueue::new()),
    };

    let store: Arc<dyn OrderStore> = Arc::new(SqlOrderStore::new(db.clone()));
    let tokens = api::auth::TokenVerifier::new(&cfg.token_secret);

    let modifications = Arc::new(OrderModificationService::new(
        store.clone(),
        gateway.clone(),
        queue.clone(),
        tokens,
        event_sender.clone(),
    ));

    // Fallback reconciliation, driven by the same components the request
    // path uses.
    if cfg.reconciliation_enabled {
        let job = Arc::new(ReconciliationJob::new(
            store.clone(),
            gateway.clone(),
            queue.clone(),
            event_sender.clone(),
            cfg.reconciliation_staleness_minutes,
        ));
        tokio::spawn(run_scheduler(job));
        info!(
            staleness_minutes = cfg.reconciliation_staleness_minutes,
            "reconciliation scheduler started"
        );
    }

    let app_state = api::AppState {
        db,
        config: cfg.clone(),
        event_sender,
        modifications,
    };

    let app = Router::new()
        .route("/", get(|| async { "order-edit-api up" }))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("order-edit-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health(State(state): State<api::AppState>) -> Json<serde_json::Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
