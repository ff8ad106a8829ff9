//! Backend error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a query backend.
///
/// Retry and readiness decisions are made on the variant, never on the
/// message text a particular driver produced.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryError {
  /// The backend, or a plugin behind it, dropped the connection mid-request.
  #[error("backend connectivity error: {message}")]
  Connectivity { message: String },

  /// No session could be handed out by the pool.
  #[error("failed to acquire session: {message}")]
  SessionAcquisition { message: String },

  /// A referenced relation does not exist.
  #[error("relation \"{relation}\" does not exist")]
  RelationNotFound { relation: String },

  /// The statement itself failed (syntax, semantics, permissions).
  #[error("query failed: {message}")]
  Query { message: String },

  /// The request was abandoned because the caller cancelled it.
  #[error("query cancelled")]
  Cancelled,
}

impl QueryError {
  /// Create a connectivity error.
  pub fn connectivity(message: impl Into<String>) -> Self {
    Self::Connectivity {
      message: message.into(),
    }
  }

  /// Create a session acquisition error.
  pub fn session_acquisition(message: impl Into<String>) -> Self {
    Self::SessionAcquisition {
      message: message.into(),
    }
  }

  /// Create a relation-not-found error.
  pub fn relation_not_found(relation: impl Into<String>) -> Self {
    Self::RelationNotFound {
      relation: relation.into(),
    }
  }

  /// Create a plain query error.
  pub fn query(message: impl Into<String>) -> Self {
    Self::Query {
      message: message.into(),
    }
  }

  /// The backend connection faulted; the same request may succeed on retry.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connectivity { .. })
  }

  pub fn is_relation_not_found(&self) -> bool {
    matches!(self, Self::RelationNotFound { .. })
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }

  /// Whether repeating the request unchanged can plausibly succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::Connectivity { .. } | Self::SessionAcquisition { .. }
    )
  }
}
