//! The contract the execution engine requires from a query backend.
//!
//! The engine never manages connection pooling itself. It acquires a
//! [`Session`], runs statements in it, consumes the streamed rows and hands
//! the session back through [`QueryClient::close_session`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

/// One result row; values are positional and line up with the result columns.
pub type Row = Vec<serde_json::Value>;

/// A stream of rows. Each item is a row or the error that ended the query;
/// the end of the stream is the completion marker.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row, QueryError>> + Send>>;

/// Column data types reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
  Text,
  Integer,
  Float,
  Boolean,
  Json,
  Jsonb,
  Timestamp,
  #[default]
  Unknown,
}

impl DataType {
  /// Structured JSON column types.
  pub fn is_json(&self) -> bool {
    matches!(self, Self::Json | Self::Jsonb)
  }
}

/// Schema of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
  pub name: String,
  #[serde(default)]
  pub data_type: DataType,
}

impl ColumnDef {
  pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
    Self {
      name: name.into(),
      data_type,
    }
  }
}

/// A backend session, checked out of the backend's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub session_id: String,
}

impl Session {
  pub fn new(session_id: impl Into<String>) -> Self {
    Self {
      session_id: session_id.into(),
    }
  }
}

/// A streamed query result.
pub struct QueryResult {
  pub columns: Vec<ColumnDef>,
  pub rows: RowStream,
}

impl QueryResult {
  pub fn new(columns: Vec<ColumnDef>, rows: RowStream) -> Self {
    Self { columns, rows }
  }

  /// Build a result whose stream yields the given rows and then ends.
  pub fn from_rows(columns: Vec<ColumnDef>, rows: Vec<Row>) -> Self {
    Self {
      columns,
      rows: stream::iter(rows.into_iter().map(Ok)).boxed(),
    }
  }

  /// Position of a column by name.
  pub fn column_index(&self, name: &str) -> Option<usize> {
    self.columns.iter().position(|c| c.name == name)
  }

  /// Drain the stream into a buffered result, stopping at the first row error.
  pub async fn collect(mut self) -> Result<SyncResult, QueryError> {
    let mut rows = Vec::new();
    while let Some(row) = self.rows.next().await {
      rows.push(row?);
    }
    Ok(SyncResult {
      columns: self.columns,
      rows,
    })
  }
}

impl std::fmt::Debug for QueryResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryResult")
      .field("columns", &self.columns)
      .finish_non_exhaustive()
  }
}

/// A fully buffered query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
  pub columns: Vec<ColumnDef>,
  pub rows: Vec<Row>,
}

impl SyncResult {
  /// Position of a column by name.
  pub fn column_index(&self, name: &str) -> Option<usize> {
    self.columns.iter().position(|c| c.name == name)
  }

  /// Rows as column-name keyed maps.
  pub fn to_maps(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
    self
      .rows
      .iter()
      .map(|row| {
        self
          .columns
          .iter()
          .zip(row.iter())
          .map(|(column, value)| (column.name.clone(), value.clone()))
          .collect()
      })
      .collect()
  }
}

/// Query backend used by the execution trees.
#[async_trait]
pub trait QueryClient: Send + Sync {
  /// Check a session out of the backend pool.
  async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Session, QueryError>;

  /// Submit a statement in a session and stream its rows.
  async fn execute_in_session(
    &self,
    session: &Session,
    sql: &str,
    args: &[serde_json::Value],
    cancel: &CancellationToken,
  ) -> Result<QueryResult, QueryError>;

  /// Run a statement outside any caller-held session and buffer the result.
  async fn execute_sync(
    &self,
    sql: &str,
    args: &[serde_json::Value],
    cancel: &CancellationToken,
  ) -> Result<SyncResult, QueryError>;

  /// Return a session to the pool. `cancelled` tells the backend the session
  /// may have an abandoned statement in flight.
  async fn close_session(&self, session: Session, cancelled: bool);
}

/// Readiness of the backend connections a search path refers to.
#[async_trait]
pub trait ConnectionReadiness: Send + Sync {
  /// Block until the first connection of every plugin referenced by
  /// `search_path` is ready.
  async fn wait_for_search_path(
    &self,
    search_path: &[String],
    cancel: &CancellationToken,
  ) -> Result<(), QueryError>;
}

/// Readiness check for backends whose connections are always usable.
#[derive(Debug, Clone, Default)]
pub struct AlwaysReady;

#[async_trait]
impl ConnectionReadiness for AlwaysReady {
  async fn wait_for_search_path(
    &self,
    _search_path: &[String],
    _cancel: &CancellationToken,
  ) -> Result<(), QueryError> {
    Ok(())
  }
}

/// Render the statement that sets a session's search path.
pub fn search_path_statement(search_path: &[String]) -> String {
  let schemas: Vec<String> = search_path
    .iter()
    .map(|schema| format!("\"{}\"", schema.replace('"', "\"\"")))
    .collect();
  format!("set search_path to {}", schemas.join(", "))
}
