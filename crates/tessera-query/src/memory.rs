//! Scripted in-memory backend.
//!
//! `MemoryClient` answers statements from a table of scripted responses keyed
//! by SQL text. It records every call so tests can assert on what the engine
//! submitted, how many sessions it took and returned, and how many queries
//! were in flight at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{
  ColumnDef, ConnectionReadiness, QueryClient, QueryResult, Row, Session, SyncResult,
};
use crate::error::QueryError;

/// A row-level failure injected part way through a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
  /// Zero-based position of the row that fails instead of being yielded.
  pub at: usize,
  pub error: QueryError,
}

/// How the backend answers one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptedResponse {
  /// Stream the rows, optionally after a delay, optionally failing at a row.
  Rows {
    columns: Vec<ColumnDef>,
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    row_error: Option<RowError>,
    #[serde(default)]
    delay_ms: Option<u64>,
  },
  /// Fail the submission.
  Error { error: QueryError },
  /// Accept the submission and never produce a row.
  Hang,
  /// Each call takes the next response; the last one repeats.
  Sequence { responses: Vec<ScriptedResponse> },
}

impl ScriptedResponse {
  pub fn rows(columns: Vec<ColumnDef>, rows: Vec<Row>) -> Self {
    Self::Rows {
      columns,
      rows,
      row_error: None,
      delay_ms: None,
    }
  }

  pub fn error(error: QueryError) -> Self {
    Self::Error { error }
  }

  /// Same rows, delivered after `delay_ms`.
  pub fn delayed(self, delay_ms: u64) -> Self {
    match self {
      Self::Rows {
        columns,
        rows,
        row_error,
        ..
      } => Self::Rows {
        columns,
        rows,
        row_error,
        delay_ms: Some(delay_ms),
      },
      other => other,
    }
  }

  /// Same rows, failing with `error` at position `at`.
  pub fn failing_at(self, at: usize, error: QueryError) -> Self {
    match self {
      Self::Rows {
        columns,
        rows,
        delay_ms,
        ..
      } => Self::Rows {
        columns,
        rows,
        row_error: Some(RowError { at, error }),
        delay_ms,
      },
      other => other,
    }
  }

  fn pick(&self, call: usize) -> &ScriptedResponse {
    match self {
      Self::Sequence { responses } if !responses.is_empty() => {
        responses[call.min(responses.len() - 1)].pick(call)
      }
      other => other,
    }
  }
}

/// Serialized form of a scripted backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFixture {
  /// Responses keyed by SQL text.
  #[serde(default)]
  pub responses: HashMap<String, ScriptedResponse>,
  /// Errors returned by the first session acquisitions, in order.
  #[serde(default)]
  pub acquire_failures: Vec<QueryError>,
  /// Error returned by every readiness check.
  #[serde(default)]
  pub readiness_error: Option<QueryError>,
}

/// One recorded statement submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
  pub session_id: Option<String>,
  pub sql: String,
  pub args: Vec<serde_json::Value>,
}

#[derive(Default)]
struct State {
  responses: Mutex<HashMap<String, ScriptedResponse>>,
  calls: Mutex<HashMap<String, usize>>,
  executions: Mutex<Vec<Execution>>,
  acquire_failures: Mutex<VecDeque<QueryError>>,
  closed: Mutex<Vec<(String, bool)>>,
  readiness_error: Mutex<Option<QueryError>>,
  readiness_checks: Mutex<Vec<Vec<String>>>,
  acquire_attempts: AtomicUsize,
  next_session: AtomicUsize,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts a query as in flight until dropped.
struct InFlight {
  state: Arc<State>,
}

impl InFlight {
  fn enter(state: &Arc<State>) -> Self {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    Self {
      state: Arc::clone(state),
    }
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
  }
}

struct ScriptedRows {
  rows: std::vec::IntoIter<Row>,
  row_error: Option<RowError>,
  delay: Option<Duration>,
  position: usize,
  hang: bool,
  finished: bool,
  cancel: CancellationToken,
  _in_flight: InFlight,
}

/// In-memory `QueryClient` answering from scripted responses.
#[derive(Clone, Default)]
pub struct MemoryClient {
  state: Arc<State>,
}

impl MemoryClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_fixture(fixture: MemoryFixture) -> Self {
    let client = Self::new();
    for (sql, response) in fixture.responses {
      client.set_response(&sql, response);
    }
    client.fail_acquire(fixture.acquire_failures);
    if let Some(error) = fixture.readiness_error {
      client.set_readiness_error(error);
    }
    client
  }

  /// Builder form of [`MemoryClient::set_response`].
  pub fn with_response(self, sql: &str, response: ScriptedResponse) -> Self {
    self.set_response(sql, response);
    self
  }

  pub fn set_response(&self, sql: &str, response: ScriptedResponse) {
    lock(&self.state.responses).insert(sql.trim().to_string(), response);
  }

  /// Make the next acquisitions fail with these errors, in order.
  pub fn fail_acquire(&self, errors: impl IntoIterator<Item = QueryError>) {
    lock(&self.state.acquire_failures).extend(errors);
  }

  pub fn set_readiness_error(&self, error: QueryError) {
    *lock(&self.state.readiness_error) = Some(error);
  }

  pub fn executions(&self) -> Vec<Execution> {
    lock(&self.state.executions).clone()
  }

  /// Number of submissions of `sql`, counting failed ones.
  pub fn call_count(&self, sql: &str) -> usize {
    lock(&self.state.calls).get(sql.trim()).copied().unwrap_or(0)
  }

  pub fn acquire_attempts(&self) -> usize {
    self.state.acquire_attempts.load(Ordering::SeqCst)
  }

  /// Closed sessions with the `cancelled` flag they were closed with.
  pub fn closed_sessions(&self) -> Vec<(String, bool)> {
    lock(&self.state.closed).clone()
  }

  pub fn readiness_checks(&self) -> Vec<Vec<String>> {
    lock(&self.state.readiness_checks).clone()
  }

  pub fn in_flight(&self) -> usize {
    self.state.in_flight.load(Ordering::SeqCst)
  }

  /// Highest number of queries observed in flight at once.
  pub fn max_in_flight(&self) -> usize {
    self.state.max_in_flight.load(Ordering::SeqCst)
  }

  /// Record the submission and pick the response for this call.
  fn submit(
    &self,
    session_id: Option<&str>,
    sql: &str,
    args: &[serde_json::Value],
  ) -> Option<ScriptedResponse> {
    let key = sql.trim().to_string();
    lock(&self.state.executions).push(Execution {
      session_id: session_id.map(str::to_string),
      sql: key.clone(),
      args: args.to_vec(),
    });

    let call = {
      let mut calls = lock(&self.state.calls);
      let count = calls.entry(key.clone()).or_insert(0);
      *count += 1;
      *count - 1
    };

    lock(&self.state.responses)
      .get(&key)
      .map(|response| response.pick(call).clone())
  }

  fn respond(
    &self,
    sql: &str,
    response: Option<ScriptedResponse>,
    cancel: &CancellationToken,
  ) -> Result<QueryResult, QueryError> {
    let response = match response {
      Some(response) => response,
      None if sql.trim_start().starts_with("set search_path") => {
        return Ok(QueryResult::from_rows(Vec::new(), Vec::new()));
      }
      None => {
        return Err(QueryError::query(format!(
          "no scripted response for statement: {}",
          sql.trim()
        )));
      }
    };

    let (columns, rows, row_error, delay_ms, hang) = match response {
      ScriptedResponse::Rows {
        columns,
        rows,
        row_error,
        delay_ms,
      } => (columns, rows, row_error, delay_ms, false),
      ScriptedResponse::Hang => (Vec::new(), Vec::new(), None, None, true),
      ScriptedResponse::Error { error } => return Err(error),
      ScriptedResponse::Sequence { .. } => {
        return Err(QueryError::query("empty scripted sequence"));
      }
    };

    let scripted = ScriptedRows {
      rows: rows.into_iter(),
      row_error,
      delay: delay_ms.map(Duration::from_millis),
      position: 0,
      hang,
      finished: false,
      cancel: cancel.clone(),
      _in_flight: InFlight::enter(&self.state),
    };

    let rows = stream::unfold(scripted, |mut s| async move {
      if s.finished {
        return None;
      }
      if let Some(delay) = s.delay.take() {
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = s.cancel.cancelled() => {
            s.finished = true;
            return Some((Err(QueryError::Cancelled), s));
          }
        }
      }
      if s.hang {
        futures::future::pending::<()>().await;
      }
      if let Some(row_error) = &s.row_error
        && row_error.at == s.position
      {
        s.finished = true;
        let error = row_error.error.clone();
        return Some((Err(error), s));
      }
      let row = s.rows.next()?;
      s.position += 1;
      Some((Ok(row), s))
    })
    .boxed();

    Ok(QueryResult::new(columns, rows))
  }
}

#[async_trait]
impl QueryClient for MemoryClient {
  async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Session, QueryError> {
    self.state.acquire_attempts.fetch_add(1, Ordering::SeqCst);
    if cancel.is_cancelled() {
      return Err(QueryError::Cancelled);
    }
    if let Some(error) = lock(&self.state.acquire_failures).pop_front() {
      return Err(error);
    }
    let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
    Ok(Session::new(format!("session-{}", id)))
  }

  async fn execute_in_session(
    &self,
    session: &Session,
    sql: &str,
    args: &[serde_json::Value],
    cancel: &CancellationToken,
  ) -> Result<QueryResult, QueryError> {
    debug!(session_id = %session.session_id, sql = %sql.trim(), "memory_execute");
    let response = self.submit(Some(&session.session_id), sql, args);
    self.respond(sql, response, cancel)
  }

  async fn execute_sync(
    &self,
    sql: &str,
    args: &[serde_json::Value],
    cancel: &CancellationToken,
  ) -> Result<SyncResult, QueryError> {
    let response = self.submit(None, sql, args);
    let result = self.respond(sql, response, cancel)?;
    tokio::select! {
      result = result.collect() => result,
      _ = cancel.cancelled() => Err(QueryError::Cancelled),
    }
  }

  async fn close_session(&self, session: Session, cancelled: bool) {
    lock(&self.state.closed).push((session.session_id, cancelled));
  }
}

#[async_trait]
impl ConnectionReadiness for MemoryClient {
  async fn wait_for_search_path(
    &self,
    search_path: &[String],
    cancel: &CancellationToken,
  ) -> Result<(), QueryError> {
    lock(&self.state.readiness_checks).push(search_path.to_vec());
    if cancel.is_cancelled() {
      return Err(QueryError::Cancelled);
    }
    match lock(&self.state.readiness_error).clone() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::DataType;
  use serde_json::json;

  fn status_columns() -> Vec<ColumnDef> {
    vec![
      ColumnDef::new("resource", DataType::Text),
      ColumnDef::new("status", DataType::Text),
    ]
  }

  #[tokio::test]
  async fn test_rows_are_streamed_and_recorded() {
    let client = MemoryClient::new().with_response(
      "select 1",
      ScriptedResponse::rows(status_columns(), vec![vec![json!("a"), json!("ok")]]),
    );
    let cancel = CancellationToken::new();
    let session = client.acquire_session(&cancel).await.unwrap();
    let result = client
      .execute_in_session(&session, "  select 1 ", &[json!(5)], &cancel)
      .await
      .unwrap();
    assert_eq!(client.in_flight(), 1);
    let buffered = result.collect().await.unwrap();
    assert_eq!(buffered.rows.len(), 1);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.max_in_flight(), 1);

    let executions = client.executions();
    assert_eq!(executions[0].sql, "select 1");
    assert_eq!(executions[0].args, vec![json!(5)]);
    assert_eq!(executions[0].session_id.as_deref(), Some("session-0"));
  }

  #[tokio::test]
  async fn test_row_error_stops_stream() {
    let rows = (0..5).map(|i| vec![json!(i), json!("ok")]).collect();
    let client = MemoryClient::new().with_response(
      "select rows",
      ScriptedResponse::rows(status_columns(), rows).failing_at(2, QueryError::query("boom")),
    );
    let cancel = CancellationToken::new();
    let mut result = client
      .execute_in_session(&Session::new("s"), "select rows", &[], &cancel)
      .await
      .unwrap();

    let mut seen = Vec::new();
    while let Some(item) = result.rows.next().await {
      seen.push(item);
    }
    assert_eq!(seen.len(), 3);
    assert!(seen[0].is_ok() && seen[1].is_ok());
    assert_eq!(seen[2], Err(QueryError::query("boom")));
  }

  #[tokio::test]
  async fn test_sequence_repeats_last_response() {
    let client = MemoryClient::new().with_response(
      "select flaky",
      ScriptedResponse::Sequence {
        responses: vec![
          ScriptedResponse::error(QueryError::connectivity("plugin exited")),
          ScriptedResponse::rows(status_columns(), vec![]),
        ],
      },
    );
    let cancel = CancellationToken::new();
    let first = client.execute_sync("select flaky", &[], &cancel).await;
    assert_eq!(first, Err(QueryError::connectivity("plugin exited")));
    assert!(client.execute_sync("select flaky", &[], &cancel).await.is_ok());
    assert!(client.execute_sync("select flaky", &[], &cancel).await.is_ok());
    assert_eq!(client.call_count("select flaky"), 3);
  }

  #[tokio::test]
  async fn test_unknown_statement_is_a_query_error() {
    let client = MemoryClient::new();
    let cancel = CancellationToken::new();
    let error = client.execute_sync("select nope", &[], &cancel).await.unwrap_err();
    assert!(matches!(error, QueryError::Query { .. }));

    let result = client
      .execute_sync("set search_path to \"aws\"", &[], &cancel)
      .await
      .unwrap();
    assert!(result.rows.is_empty());
  }

  #[tokio::test]
  async fn test_acquire_failures_are_consumed_in_order() {
    let client = MemoryClient::new();
    client.fail_acquire([QueryError::session_acquisition("pool exhausted")]);
    let cancel = CancellationToken::new();
    assert!(client.acquire_session(&cancel).await.is_err());
    assert!(client.acquire_session(&cancel).await.is_ok());
    assert_eq!(client.acquire_attempts(), 2);
  }

  #[tokio::test]
  async fn test_hang_is_abandoned_by_cancellation() {
    let client = MemoryClient::new().with_response("select forever", ScriptedResponse::Hang);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });
    let error = client
      .execute_sync("select forever", &[], &cancel)
      .await
      .unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(client.in_flight(), 0);
  }

  #[test]
  fn test_fixture_deserializes() {
    let fixture: MemoryFixture = serde_json::from_value(json!({
      "responses": {
        "select 1": {
          "type": "rows",
          "columns": [{ "name": "n", "data_type": "integer" }],
          "rows": [[1]]
        },
        "select 2": { "type": "hang" }
      },
      "acquire_failures": [{ "kind": "session_acquisition", "message": "busy" }]
    }))
    .unwrap();
    assert_eq!(fixture.responses.len(), 2);
    assert_eq!(fixture.acquire_failures.len(), 1);
    let client = MemoryClient::from_fixture(fixture);
    assert_eq!(client.call_count("select 1"), 0);
  }
}
