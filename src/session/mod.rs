//! Per-connection sessions and per-query contexts.
//!
//! A `Session` owns the connection-scoped state: the repository pool handle,
//! the authenticated user, session options and the lazily connected external
//! analysis client. Each query clones the session handle into a `Context`
//! that adds the query id, a tracing span and a cancellation token which
//! every row iterator observes between rows.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::executor::{ExecuteError, ExecuteResult};
use crate::index::IndexRegistry;
use crate::storage::RepositoryPool;

/// Attempts made when connecting to the analysis service.
const ANALYSIS_MAX_ATTEMPTS: u32 = 10;
/// Pause between connection attempts.
const ANALYSIS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection-scoped state shared by every query of one client.
pub struct Session {
    pool: Arc<RepositoryPool>,
    indexes: Arc<IndexRegistry>,
    database: String,
    user: String,
    skip_git_errors: bool,
    analysis_endpoint: Option<String>,
    client: Mutex<Option<AnalysisClient>>,
    bag: Mutex<HashMap<String, String>>,
}

impl Session {
    pub fn new(pool: Arc<RepositoryPool>, indexes: Arc<IndexRegistry>) -> Self {
        Self {
            pool,
            indexes,
            database: "gitql".to_string(),
            user: "root".to_string(),
            skip_git_errors: false,
            analysis_endpoint: None,
            client: Mutex::new(None),
            bag: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_database(mut self, name: impl Into<String>) -> Self {
        self.database = name.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// When set, git decoding errors skip the affected row or repository
    /// instead of failing the query. The flag is per session: two sessions
    /// over one pool may see different result sets for a broken repository.
    pub fn with_skip_git_errors(mut self, enabled: bool) -> Self {
        self.skip_git_errors = enabled;
        self
    }

    pub fn with_analysis_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.analysis_endpoint = Some(endpoint.into());
        self
    }

    pub fn pool(&self) -> &Arc<RepositoryPool> {
        &self.pool
    }

    pub fn indexes(&self) -> &Arc<IndexRegistry> {
        &self.indexes
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn skip_git_errors(&self) -> bool {
        self.skip_git_errors
    }

    /// Typed key-value bag for session-scoped odds and ends.
    pub fn bag_get(&self, key: &str) -> Option<String> {
        self.bag.lock().get(key).cloned()
    }

    pub fn bag_set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.bag.lock().insert(key.into(), value.into());
    }

    /// Run `f` with the lazily connected analysis client. The first use
    /// attempts the connection with bounded retries; exhaustion surfaces a
    /// single error class.
    fn with_analysis_client<T>(
        &self,
        f: impl FnOnce(&mut AnalysisClient) -> ExecuteResult<T>,
    ) -> ExecuteResult<T> {
        let endpoint = self
            .analysis_endpoint
            .as_deref()
            .ok_or_else(|| ExecuteError::ExternalService("no analysis service configured".into()))?;

        let mut guard = self.client.lock();
        if guard.is_none() {
            *guard = Some(AnalysisClient::connect(endpoint)?);
        }
        let client = guard.as_mut().expect("client just connected");
        f(client)
    }

    pub fn analysis_parse(&self, language: &str, content: &[u8]) -> ExecuteResult<String> {
        self.with_analysis_client(|c| c.parse(language, content))
    }

    pub fn analysis_filter(&self, tree: &str, query: &str) -> ExecuteResult<String> {
        self.with_analysis_client(|c| c.filter(tree, query))
    }

    /// Release owned clients. Double close is a no-op.
    pub fn close(&self) {
        self.client.lock().take();
    }
}

/// Client for the external source-analysis service. Speaks one JSON request
/// per line and expects one JSON response per line.
struct AnalysisClient {
    stream: TcpStream,
}

#[derive(Deserialize)]
struct AnalysisResponse {
    ok: bool,
    #[serde(default)]
    result: String,
    #[serde(default)]
    error: String,
}

impl AnalysisClient {
    fn connect(endpoint: &str) -> ExecuteResult<Self> {
        for attempt in 0..ANALYSIS_MAX_ATTEMPTS {
            match TcpStream::connect(endpoint) {
                Ok(stream) => return Ok(Self { stream }),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "analysis service connection failed");
                    std::thread::sleep(ANALYSIS_RETRY_DELAY);
                }
            }
        }
        Err(ExecuteError::ExternalService(
            "unable to establish analysis service connection".into(),
        ))
    }

    fn request(&mut self, body: serde_json::Value) -> ExecuteResult<String> {
        let line = serde_json::to_string(&body)
            .map_err(|e| ExecuteError::ExternalService(e.to_string()))?;
        writeln!(self.stream, "{}", line)
            .map_err(|e| ExecuteError::ExternalService(e.to_string()))?;

        let mut reader = BufReader::new(&self.stream);
        let mut response = String::new();
        reader
            .read_line(&mut response)
            .map_err(|e| ExecuteError::ExternalService(e.to_string()))?;

        let parsed: AnalysisResponse = serde_json::from_str(response.trim())
            .map_err(|e| ExecuteError::ExternalService(e.to_string()))?;
        if parsed.ok {
            Ok(parsed.result)
        } else {
            Err(ExecuteError::ExternalService(parsed.error))
        }
    }

    fn parse(&mut self, language: &str, content: &[u8]) -> ExecuteResult<String> {
        self.request(serde_json::json!({
            "op": "parse",
            "language": language,
            "content": String::from_utf8_lossy(content),
        }))
    }

    fn filter(&mut self, tree: &str, query: &str) -> ExecuteResult<String> {
        self.request(serde_json::json!({
            "op": "filter",
            "tree": tree,
            "query": query,
        }))
    }
}

/// Cooperative cancellation flag shared between a query and its caller.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-query state handed into every row iterator.
#[derive(Clone)]
pub struct Context {
    session: Arc<Session>,
    query_id: String,
    cancel: CancelToken,
    span: tracing::Span,
    /// When set, table iterators only visit this subset of the pool. Used
    /// by the exchange node to partition work by repository.
    repo_subset: Option<Arc<Vec<String>>>,
}

impl Context {
    pub fn new(session: Arc<Session>) -> Self {
        let query_id = ulid::Ulid::new().to_string().to_lowercase();
        let span = tracing::info_span!("query", id = %query_id);
        Self {
            session,
            query_id,
            cancel: CancelToken::new(),
            span,
            repo_subset: None,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancellation check; every iterator calls this between rows.
    pub fn check(&self) -> ExecuteResult<()> {
        if self.cancel.is_cancelled() {
            Err(ExecuteError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn pool(&self) -> &Arc<RepositoryPool> {
        self.session.pool()
    }

    pub fn indexes(&self) -> &Arc<IndexRegistry> {
        self.session.indexes()
    }

    pub fn skip_git_errors(&self) -> bool {
        self.session.skip_git_errors()
    }

    /// Repository ids this context may touch, in pool order.
    pub fn repo_ids(&self) -> Vec<String> {
        match &self.repo_subset {
            Some(subset) => subset.as_ref().clone(),
            None => self.session.pool().ids(),
        }
    }

    /// A context restricted to a subset of repositories, sharing the same
    /// session and cancellation token.
    pub fn with_repo_subset(&self, ids: Vec<String>) -> Context {
        Context {
            repo_subset: Some(Arc::new(ids)),
            ..self.clone()
        }
    }

    pub fn analysis_parse(&self, language: &str, content: &[u8]) -> ExecuteResult<String> {
        self.session.analysis_parse(language, content)
    }

    pub fn analysis_filter(&self, tree: &str, query: &str) -> ExecuteResult<String> {
        self.session.analysis_filter(tree, query)
    }

    /// Context over an empty pool, for expression-level tests.
    #[cfg(test)]
    pub fn for_tests() -> Context {
        let dir = std::env::temp_dir().join(format!("gitql-test-indexes-{}", ulid::Ulid::new()));
        let session = Session::new(
            Arc::new(RepositoryPool::default()),
            Arc::new(IndexRegistry::new(dir)),
        );
        Context::new(Arc::new(session))
    }

    /// Context over a given pool, for table and plan tests.
    #[cfg(test)]
    pub fn for_pool(pool: Arc<RepositoryPool>) -> Context {
        let dir = std::env::temp_dir().join(format!("gitql-test-indexes-{}", ulid::Ulid::new()));
        let session = Session::new(pool, Arc::new(IndexRegistry::new(dir)));
        Context::new(Arc::new(session))
    }
}
