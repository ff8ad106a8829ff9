use tessera_config::ConfigError;
use tessera_control::ControlError;
use tessera_query::QueryError;
use thiserror::Error;

/// Why a runtime dependency could not be resolved.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DependencyError {
  /// The publishing node failed.
  #[error("'{name}' failed: {message}")]
  Failed { name: String, message: String },

  /// The publisher went away without publishing.
  #[error("'{name}' was never published")]
  Unpublished { name: String },

  /// The published value has no value at the requested path.
  #[error("cannot project '{path}' from '{name}': {message}")]
  Projection {
    name: String,
    path: String,
    message: String,
  },

  /// A parameter with no default and no value supplied.
  #[error("no value for '{name}'")]
  Missing { name: String },

  #[error("cancelled while waiting for '{name}'")]
  Cancelled { name: String },
}

/// Errors raised by dashboard nodes and the dashboard execution tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DashboardError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("query failed: {source}")]
  Query {
    #[from]
    source: QueryError,
  },

  #[error("node '{node}' could not resolve '{reference}': {source}")]
  Dependency {
    node: String,
    reference: String,
    source: DependencyError,
  },

  #[error("check failed: {source}")]
  Control {
    #[from]
    source: ControlError,
  },

  #[error("invalid dashboard definition: {message}")]
  InvalidDefinition { message: String },

  #[error("dashboard tree has already been executed")]
  AlreadyExecuted,

  #[error("execution cancelled")]
  Cancelled,

  #[error("node '{node}' panicked: {message}")]
  Panicked { node: String, message: String },

  #[error("{}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
  Combined { errors: Vec<DashboardError> },
}

impl DashboardError {
  pub(crate) fn invalid(message: impl Into<String>) -> Self {
    Self::InvalidDefinition {
      message: message.into(),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    match self {
      Self::Cancelled => true,
      Self::Query { source } => source.is_cancelled(),
      Self::Control { source } => source.is_cancelled(),
      Self::Dependency { source, .. } => matches!(source, DependencyError::Cancelled { .. }),
      Self::Combined { errors } => !errors.is_empty() && errors.iter().all(Self::is_cancelled),
      _ => false,
    }
  }

  /// Collapse child errors: none, the single error, or all of them combined.
  pub fn combine(mut errors: Vec<DashboardError>) -> Option<DashboardError> {
    match errors.len() {
      0 => None,
      1 => errors.pop(),
      _ => Some(Self::Combined { errors }),
    }
  }
}
