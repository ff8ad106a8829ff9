use tessera_config::ConfigError;
use tessera_query::QueryError;
use thiserror::Error;

/// Errors raised by control runs and the control execution tree.
///
/// Stored on run nodes and read by many observers, so every variant is
/// `Clone`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// Submitting or running the control query failed.
  #[error("query failed: {source}")]
  Query {
    #[from]
    source: QueryError,
  },

  /// A result row carried its own error.
  #[error("row error: {source}")]
  Row { source: QueryError },

  #[error("failed to acquire session after {attempts} attempts: {source}")]
  SessionAcquisition { attempts: u32, source: QueryError },

  #[error("control '{control}' result is missing required columns: {}", missing.join(", "))]
  MissingColumns { control: String, missing: Vec<String> },

  #[error("control '{control}' returned invalid status '{status}'")]
  InvalidStatus { control: String, status: String },

  #[error("control '{control}' timed out after {timeout_ms}ms")]
  Timeout { control: String, timeout_ms: u64 },

  #[error("execution cancelled")]
  Cancelled,

  #[error("control run panicked: {message}")]
  Panicked { message: String },

  #[error("{remaining} control runs did not finish within the drain timeout")]
  DrainTimeout { remaining: usize },

  #[error("{}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
  Combined { errors: Vec<ControlError> },
}

impl ControlError {
  /// Whether the error was caused by cancellation.
  pub fn is_cancelled(&self) -> bool {
    match self {
      Self::Cancelled => true,
      Self::Query { source } | Self::Row { source } => source.is_cancelled(),
      Self::SessionAcquisition { source, .. } => source.is_cancelled(),
      Self::Combined { errors } => !errors.is_empty() && errors.iter().all(Self::is_cancelled),
      _ => false,
    }
  }

  /// Collapse a list of errors: none, the single error, or all of them combined.
  pub fn combine(mut errors: Vec<ControlError>) -> Option<ControlError> {
    match errors.len() {
      0 => None,
      1 => errors.pop(),
      _ => Some(Self::Combined { errors }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_combine() {
    assert_eq!(ControlError::combine(vec![]), None);
    assert_eq!(
      ControlError::combine(vec![ControlError::Cancelled]),
      Some(ControlError::Cancelled)
    );
    let combined = ControlError::combine(vec![
      ControlError::Cancelled,
      ControlError::DrainTimeout { remaining: 2 },
    ])
    .unwrap();
    assert_eq!(
      combined.to_string(),
      "execution cancelled; 2 control runs did not finish within the drain timeout"
    );
  }

  #[test]
  fn test_cancellation_classification() {
    assert!(ControlError::Cancelled.is_cancelled());
    assert!(ControlError::from(QueryError::Cancelled).is_cancelled());
    assert!(!ControlError::from(QueryError::query("syntax")).is_cancelled());
  }
}
