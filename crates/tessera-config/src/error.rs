use thiserror::Error;

/// Errors raised while loading or resolving resource definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {message}")]
  Read { path: String, message: String },

  #[error("failed to parse {path}: {message}")]
  Parse { path: String, message: String },

  #[error("resource not found: {name}")]
  NotFound { name: String },

  #[error("duplicate resource name: {name}")]
  DuplicateName { name: String },

  #[error("'{parent}' references unknown resource '{child}'")]
  DanglingReference { parent: String, child: String },

  #[error("cycle detected at '{name}'")]
  CycleDetected { name: String },

  #[error("resource '{resource}' has neither sql nor a query reference")]
  MissingSql { resource: String },

  #[error("resource '{resource}' references unknown query '{query}'")]
  QueryNotFound { resource: String, query: String },

  #[error("query '{query}' is missing a value for parameter '{param}'")]
  MissingArgument { query: String, param: String },

  #[error("query '{query}' has no parameter named '{arg}'")]
  UnknownArgument { query: String, arg: String },

  #[error("variable not defined: {name}")]
  UndefinedVariable { name: String },

  #[error("invalid argument for '{resource}': {message}")]
  InvalidArgument { resource: String, message: String },

  #[error("invalid resource '{name}': {message}")]
  InvalidResource { name: String, message: String },
}
