//! # memoctl: quota-aware batch document analysis
//!
//! `memoctl` analyses the documents attached to a job with a generative-AI model and writes the
//! extracted attributes to a spreadsheet. The model is reached through a pool of API keys, each
//! allowed a fixed number of calls per day. Usage counters live in the shared code table, so
//! every call made by any job is charged to exactly one key.
//!
//! ## Flow
//!
//! 1. `POST /api/v1/analysis/jobs` records a run and spawns the job.
//! 2. The job's files are filtered and split into batches ([`analysis::BatchPlanner`]).
//! 3. Keys covering one call per batch are reserved up front ([`quota::KeyAllocator`]). A job the
//!    pool cannot cover fails before any call is made.
//! 4. Batches are sent one after another, rotating keys as each reaches its capacity
//!    ([`analysis::AnalysisRunner`]). A failed batch becomes placeholder rows and the job goes on.
//! 5. The calls actually made are committed to the key counters in one transaction.
//! 6. The records are written to an `.xlsx` artifact registered next to the job's files
//!    ([`analysis::ResultExporter`]).
//!
//! Counters return to zero daily ([`quota::QuotaResetDaemon`]).
//!
//! ## Persistence
//!
//! PostgreSQL through `sqlx`; migrations are embedded and run on startup. Documents and artifacts
//! are mirrored to a [`storage::BlobStorage`] backend (local directory or Google Drive).

pub mod analysis;
pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
pub mod generative;
mod openapi;
pub mod quota;
pub mod runs;
pub mod storage;
pub mod telemetry;
#[cfg(test)]
mod test_utils;
pub mod types;

use crate::{
    analysis::Analyzer,
    api::handlers,
    catalog::PostgresFileCatalog,
    generative::GeminiClient,
    openapi::ApiDoc,
    quota::{KeyAllocator, PostgresQuotaStore, QuotaResetDaemon, QuotaStore},
    runs::{PostgresRunStore, RunStore},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Application state shared across all request handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub analyzer: Arc<Analyzer>,
    pub runs: Arc<dyn RunStore>,
    /// Analysis jobs started by requests; drained before shutdown completes
    #[builder(default)]
    pub jobs: TaskTracker,
}

/// Get the memoctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect to PostgreSQL and apply pending migrations.
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool_settings = &config.database.pool;
    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(pool_settings.acquire_timeout)
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;
    Ok(pool)
}

/// Wire the analyzer to its Postgres-backed collaborators and the configured model and storage.
fn build_analyzer(
    config: &Config,
    pool: &PgPool,
    quota_store: Arc<dyn QuotaStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<Analyzer> {
    let analyzer_config = config.analyzer.clone();
    let client = GeminiClient::new(&analyzer_config.api_base_url, &analyzer_config.model, analyzer_config.request_timeout)?;
    let blobs = storage::create_blob_storage(&config.storage, analyzer_config.request_timeout)?;

    Ok(Analyzer::builder()
        .allocator(Arc::new(KeyAllocator::new(quota_store, analyzer_config.key_capacity)))
        .client(Arc::new(client))
        .blobs(blobs)
        .catalog(Arc::new(PostgresFileCatalog::new(pool.clone())))
        .upload_artifacts(config.upload_artifacts)
        .shutdown(shutdown)
        .config(analyzer_config)
        .build())
}

/// Build the application router: the `/api/v1` routes, health check, OpenAPI docs and tracing.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> Router {
    let max_upload_size = state.config.max_upload_size;

    let api_routes = Router::new()
        .route("/analysis/jobs", post(handlers::analysis::trigger_analysis))
        .route("/analysis/runs/{run_id}", get(handlers::analysis::get_run))
        .route("/analysis/jobs/{job_id}/runs", get(handlers::analysis::list_job_runs))
        .route(
            "/advice",
            post(handlers::advice::advise).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/quota/checkout", post(handlers::quota::checkout_key))
        .route("/quota/keys", get(handlers::quota::list_key_usage))
        .route("/quota/reset", post(handlers::quota::reset_usage));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::health::healthz))
        .route("/api-docs/openapi.json", get(|| async { axum::Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Tasks running alongside the HTTP server.
///
/// Dropping this without calling [`shutdown`](BackgroundServices::shutdown) still cancels the
/// tasks through the drop guard.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Start the daily quota reset, when enabled.
fn setup_background_services(
    config: &Config,
    quota_store: Arc<dyn QuotaStore>,
    shutdown_token: CancellationToken,
) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.quota_reset.enabled {
        let at = config
            .quota_reset
            .time()
            .ok_or_else(|| anyhow::anyhow!("invalid quota_reset.at '{}'", config.quota_reset.at))?;
        let offset = config
            .quota_reset
            .offset()
            .ok_or_else(|| anyhow::anyhow!("invalid quota_reset.utc_offset_hours {}", config.quota_reset.utc_offset_hours))?;

        let daemon = QuotaResetDaemon::new(quota_store, at, offset);
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            info!("Starting quota reset daemon");
            daemon.run(token).await;
        }));
    } else {
        info!("Quota reset daemon disabled");
    }

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

/// The running service: router, state, database pool and background tasks.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations and starts
///    background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests until the
///    shutdown future resolves, then stops background services, waits for running analysis jobs
///    to record their usage, and closes the pool
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
    jobs: TaskTracker,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting memoctl with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;

        let quota_store: Arc<dyn QuotaStore> = Arc::new(PostgresQuotaStore::new(pool.clone(), config.analyzer.key_selector()));
        let shutdown_token = CancellationToken::new();
        let analyzer = build_analyzer(&config, &pool, quota_store.clone(), shutdown_token.clone())?;
        let bg_services = setup_background_services(&config, quota_store, shutdown_token)?;

        let jobs = TaskTracker::new();
        let app_state = AppState::builder()
            .config(config.clone())
            .analyzer(Arc::new(analyzer))
            .runs(Arc::new(PostgresRunStore::new(pool.clone())))
            .jobs(jobs.clone())
            .build();
        let router = build_router(app_state);

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
            jobs,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "memoctl listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Cancels running jobs too: they share the shutdown token with the background services.
        self.bg_services.shutdown().await;

        self.jobs.close();
        if !self.jobs.is_empty() {
            info!(jobs = self.jobs.len(), "Waiting for analysis jobs to record their usage...");
        }
        self.jobs.wait().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::create_test_app;

    #[tokio::test]
    async fn health_and_docs_are_served() {
        let app = create_test_app(&[], vec![]).await;

        app.server.get("/healthz").await.assert_status_ok();

        let doc = app.server.get("/api-docs/openapi.json").await;
        doc.assert_status_ok();
        assert!(doc.text().contains("/quota/checkout"));

        app.server.get("/docs").await.assert_status_ok();
    }
}
