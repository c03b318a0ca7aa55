//! Run records and the reporter that persists them.
//!
//! Recording is best effort: a reporter failure is logged and reported as
//! `false`, never as a failed execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ReporterConfig;
use crate::types::{ExecutionRequest, ExecutionResult};

/// Longest code snippet or output stored with a record, in characters.
pub const SNIPPET_LIMIT: usize = 1000;

/// Algorithm name recorded when the caller did not provide one.
const UNNAMED_ALGORITHM: &str = "custom";

/// One persisted execution. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub user_id: String,
    pub algorithm_name: String,
    pub input_size: Option<u64>,
    pub execution_time_ms: f64,
    pub code_snippet: String,
    pub output_result: String,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Build a record for a finished request, clipping stored text.
    pub fn new(user_id: &str, request: &ExecutionRequest, result: &ExecutionResult) -> Self {
        Self {
            user_id: user_id.to_string(),
            algorithm_name: request
                .algorithm_label()
                .unwrap_or(UNNAMED_ALGORITHM)
                .to_string(),
            input_size: request.input_size(),
            execution_time_ms: result.runtime_ms,
            code_snippet: clip(request.source_code()),
            output_result: clip(result.display_text()),
            created_at: Utc::now(),
        }
    }
}

fn clip(text: &str) -> String {
    text.chars().take(SNIPPET_LIMIT).collect()
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reporter request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("reporter returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sink for run records.
#[async_trait]
pub trait RunReporter: Send + Sync {
    /// Append a record. Returns whether it was saved.
    async fn record_run(&self, record: &RunRecord) -> bool;

    /// Records of `user_id`, oldest first, optionally for one algorithm.
    async fn list_runs(
        &self,
        user_id: &str,
        algorithm_name: Option<&str>,
    ) -> Result<Vec<RunRecord>, ReportError>;
}

/// Reporter backed by a Supabase table through its PostgREST API.
#[derive(Debug, Clone)]
pub struct SupabaseReporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl SupabaseReporter {
    pub fn new(config: &ReporterConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &ReporterConfig) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.url.trim_end_matches('/'),
                config.table
            ),
            api_key: config.api_key.clone(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn insert(&self, record: &RunRecord) -> Result<(), ReportError> {
        let response = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        ensure_success(response).await.map(drop)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ReportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RunReporter for SupabaseReporter {
    async fn record_run(&self, record: &RunRecord) -> bool {
        match self.insert(record).await {
            Ok(()) => {
                debug!(user = %record.user_id, algorithm = %record.algorithm_name, "Recorded run");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to record run");
                false
            }
        }
    }

    async fn list_runs(
        &self,
        user_id: &str,
        algorithm_name: Option<&str>,
    ) -> Result<Vec<RunRecord>, ReportError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("order", "created_at.asc".to_string()),
        ];
        if let Some(name) = algorithm_name {
            query.push(("algorithm_name", format!("eq.{name}")));
        }

        let response = self
            .authorized(self.client.get(&self.endpoint))
            .query(&query)
            .send()
            .await?;
        let records = ensure_success(response).await?.json().await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, Language};
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct MockState {
        rows: Arc<Mutex<Vec<RunRecord>>>,
        keys: Arc<Mutex<Vec<String>>>,
        queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    }

    async fn insert(
        State(state): State<MockState>,
        headers: HeaderMap,
        Json(record): Json<RunRecord>,
    ) -> StatusCode {
        let key = headers
            .get("apikey")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.keys.lock().unwrap().push(key);
        state.rows.lock().unwrap().push(record);
        StatusCode::CREATED
    }

    async fn select(
        State(state): State<MockState>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Vec<RunRecord>> {
        state.queries.lock().unwrap().push(query);
        Json(state.rows.lock().unwrap().clone())
    }

    async fn start_mock(state: MockState) -> SocketAddr {
        let app = Router::new()
            .route("/rest/v1/runtime_logs", post(insert).get(select))
            .route(
                "/rest/v1/broken",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "db down") }),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn reporter(addr: SocketAddr, table: &str) -> SupabaseReporter {
        SupabaseReporter::new(&ReporterConfig {
            url: format!("http://{addr}/"),
            api_key: "service-key".into(),
            table: table.into(),
        })
    }

    fn sample_record() -> RunRecord {
        let request = ExecutionRequest::new("print(sorted([3,1,2]))", Language::Python)
            .unwrap()
            .with_algorithm_label("heap_sort")
            .with_input_size(3);
        let result = ExecutionResult::success(
            "[1, 2, 3]",
            Duration::from_millis(8),
            BackendKind::Sandbox,
            1024,
        );
        RunRecord::new("user-1", &request, &result)
    }

    #[test]
    fn record_clips_long_text() {
        let long = "x".repeat(SNIPPET_LIMIT + 50);
        let request = ExecutionRequest::new(long.clone(), Language::Python).unwrap();
        let result =
            ExecutionResult::success(&long, Duration::from_millis(1), BackendKind::Fallback, 1 << 20);
        let record = RunRecord::new("u", &request, &result);

        assert_eq!(record.code_snippet.chars().count(), SNIPPET_LIMIT);
        assert_eq!(record.output_result.chars().count(), SNIPPET_LIMIT);
        assert_eq!(record.algorithm_name, "custom");
        assert_eq!(record.input_size, None);
    }

    #[tokio::test]
    async fn record_and_list_roundtrip_through_postgrest() {
        let state = MockState::default();
        let addr = start_mock(state.clone()).await;
        let reporter = reporter(addr, "runtime_logs");

        let record = sample_record();
        assert!(reporter.record_run(&record).await);
        assert_eq!(state.keys.lock().unwrap().as_slice(), ["service-key"]);

        let listed = reporter.list_runs("user-1", Some("heap_sort")).await.unwrap();
        assert_eq!(listed, vec![record]);

        let queries = state.queries.lock().unwrap();
        assert_eq!(queries[0]["user_id"], "eq.user-1");
        assert_eq!(queries[0]["algorithm_name"], "eq.heap_sort");
        assert_eq!(queries[0]["order"], "created_at.asc");
    }

    #[tokio::test]
    async fn failed_insert_returns_false() {
        let addr = start_mock(MockState::default()).await;
        let reporter = reporter(addr, "broken");
        assert!(!reporter.record_run(&sample_record()).await);
    }

    #[tokio::test]
    async fn unreachable_reporter_returns_false() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reporter = reporter(addr, "runtime_logs");
        assert!(!reporter.record_run(&sample_record()).await);
        assert!(reporter.list_runs("user-1", None).await.is_err());
    }
}
