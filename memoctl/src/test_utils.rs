//! Shared fixtures for unit tests.

use crate::analysis::Analyzer;
use crate::catalog::InMemoryFileCatalog;
use crate::config::{AnalyzerConfig, Config};
use crate::generative::{BinaryPart, GenerativeClient, GenerativeError};
use crate::quota::{InMemoryQuotaStore, KeyAllocator};
use crate::runs::InMemoryRunStore;
use crate::storage::LocalBlobStorage;
use crate::{AppState, build_router};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Reqwest is built without a default TLS provider; install one before creating clients.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Analyzer settings for tests: one file per batch, no pacing, files under `source_dir`.
pub fn test_analyzer_config(source_dir: &Path) -> AnalyzerConfig {
    AnalyzerConfig {
        batch_size: 1,
        inter_batch_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        source_dir: source_dir.to_path_buf(),
        ..AnalyzerConfig::default()
    }
}

/// Write placeholder content for each named file under `dir`.
pub fn write_source_files(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), format!("content of {name}")).unwrap();
    }
}

/// Canned answer for one call to [`ScriptedClient`].
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers; exercises request timeouts.
    Hang,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Text(text.to_string())
    }

    pub fn fail(message: &str) -> Self {
        Reply::Fail(message.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub api_key: String,
    pub prompt: String,
    pub mime_types: Vec<String>,
}

/// [`GenerativeClient`] that answers from a script and records every call.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.api_key).collect()
    }
}

#[async_trait]
impl GenerativeClient for ScriptedClient {
    async fn generate(&self, api_key: &str, prompt: &str, parts: &[BinaryPart]) -> Result<String, GenerativeError> {
        self.calls.lock().unwrap().push(RecordedCall {
            api_key: api_key.to_string(),
            prompt: prompt.to_string(),
            mime_types: parts.iter().map(|p| p.mime_type.clone()).collect(),
        });
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(GenerativeError::Status {
                status: 503,
                body: message,
            }),
            Some(Reply::Hang) => {
                std::future::pending::<()>().await;
                Err(GenerativeError::EmptyResponse)
            }
            None => Err(GenerativeError::Status {
                status: 500,
                body: "no scripted reply".to_string(),
            }),
        }
    }
}

/// A router over in-memory collaborators, with handles to inspect them.
pub struct TestApp {
    pub server: axum_test::TestServer,
    pub store: Arc<InMemoryQuotaStore>,
    pub catalog: Arc<InMemoryFileCatalog>,
    pub client: Arc<ScriptedClient>,
    /// Cancels the analyzer's running jobs
    pub shutdown: CancellationToken,
    pub jobs: TaskTracker,
    dir: tempfile::TempDir,
}

impl TestApp {
    pub fn source_dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Admin token configured on the test router.
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

/// Build the full router with keys `API_KEY1..n` at the given usage and a scripted model.
pub async fn create_test_app(usage: &[u32], replies: Vec<Reply>) -> TestApp {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(InMemoryQuotaStore::with_usage("CC004", "API_KEY", usage));
    let catalog = Arc::new(InMemoryFileCatalog::new());
    let client = Arc::new(ScriptedClient::new(replies));

    let analyzer_config = test_analyzer_config(dir.path());
    let config = Config {
        analyzer: analyzer_config.clone(),
        admin_token: Some(TEST_ADMIN_TOKEN.to_string()),
        ..Config::default()
    };
    let shutdown = CancellationToken::new();
    let jobs = TaskTracker::new();
    let analyzer = Analyzer::builder()
        .allocator(Arc::new(KeyAllocator::new(store.clone(), analyzer_config.key_capacity)))
        .config(analyzer_config)
        .client(client.clone())
        .blobs(Arc::new(LocalBlobStorage::new(dir.path().join("blobs"))))
        .catalog(catalog.clone())
        .shutdown(shutdown.clone())
        .build();

    let state = AppState::builder()
        .config(config)
        .analyzer(Arc::new(analyzer))
        .runs(Arc::new(InMemoryRunStore::new()))
        .jobs(jobs.clone())
        .build();
    let server = axum_test::TestServer::new(build_router(state)).expect("Failed to create test server");

    TestApp {
        server,
        store,
        catalog,
        client,
        shutdown,
        jobs,
        dir,
    }
}
