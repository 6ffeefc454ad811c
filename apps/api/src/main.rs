use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use patient_flow_cell::{
    FlowSettings, HttpNotifier, PatientFlowEngine, RedisEventRelay, RedisPauseFlags,
    SupabaseAuditSink, SupabaseServiceCatalog, SweepWorker,
};
use shared_config::AppConfig;
use shared_database::{ClinicStore, PostgresStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic flow API server");

    // Load configuration
    let config = AppConfig::from_env();
    let store = build_store(&config).await?;
    let engine = Arc::new(build_engine(&config, store.clone())?);

    if let Some(redis_url) = &config.redis_url {
        RedisEventRelay::new(redis_url)?.spawn(engine.subscribe());
    }
    SweepWorker::new(
        Arc::clone(&engine),
        Duration::from_secs(config.sweep_interval_seconds.max(1)),
    )
    .spawn();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(store, engine)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Postgres when `DATABASE_URL` is set; otherwise rows live only in this process.
async fn build_store(config: &AppConfig) -> anyhow::Result<ClinicStore> {
    match &config.database_url {
        Some(url) => {
            let postgres = PostgresStore::connect(url, config.database_max_connections).await?;
            postgres.migrate().await?;
            Ok(ClinicStore::new(postgres.into_backend()))
        }
        None => {
            warn!("DATABASE_URL not set, clinic data is held in memory and lost on restart");
            Ok(ClinicStore::in_memory())
        }
    }
}

/// Pick remote collaborators where they are configured, in-process ones otherwise.
fn build_engine(config: &AppConfig, store: ClinicStore) -> anyhow::Result<PatientFlowEngine> {
    let mut engine = PatientFlowEngine::new(store, FlowSettings::from_config(config));

    if config.is_supabase_configured() {
        engine = engine
            .with_audit_sink(Arc::new(SupabaseAuditSink::new(config)))
            .with_catalog(Arc::new(SupabaseServiceCatalog::new(config)));
    } else {
        warn!("Supabase not configured, audit records go to the log and every service uses the default duration");
    }

    if let Some(url) = &config.notifier_webhook_url {
        engine = engine.with_notifier(Arc::new(HttpNotifier::new(url.clone())));
    }

    if let Some(redis_url) = &config.redis_url {
        engine = engine.with_pause_flags(Arc::new(RedisPauseFlags::new(redis_url)?));
    } else {
        info!("REDIS_URL not set, queue pause flags are local to this instance");
    }

    Ok(engine)
}
