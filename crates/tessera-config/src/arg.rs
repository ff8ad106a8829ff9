//! Query arguments and their binding to query parameters.
//!
//! An argument is either known when the tree is built (a literal or a
//! workspace variable) or supplied by another node at runtime (an input, a
//! dashboard parameter or a `with` result).
//!
//! ```json
//! [
//!   { "value": "us-east-1" },
//!   { "name": "account", "var": "account_id" },
//!   { "input": "region" },
//!   { "with": "buckets", "path": "rows[*].arn" }
//! ]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where an argument's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSource {
  With {
    with: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    array: bool,
  },
  Input {
    input: String,
  },
  Param {
    param: String,
  },
  Var {
    var: String,
  },
  Value {
    value: serde_json::Value,
  },
}

/// One argument of a query-bearing resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgDef {
  /// Binds to the query parameter of this name; unnamed args bind in order.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(flatten)]
  pub source: ArgSource,
}

impl ArgDef {
  pub fn value(value: serde_json::Value) -> Self {
    Self {
      name: None,
      source: ArgSource::Value { value },
    }
  }

  pub fn named(name: impl Into<String>, source: ArgSource) -> Self {
    Self {
      name: Some(name.into()),
      source,
    }
  }

  pub fn positional(source: ArgSource) -> Self {
    Self { name: None, source }
  }
}

/// Kind of runtime dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
  Input,
  Param,
  With,
}

impl DependencyKind {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Input => "input",
      Self::Param => "param",
      Self::With => "with",
    }
  }
}

/// A value another node supplies at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeRef {
  pub kind: DependencyKind,
  pub name: String,
  /// Projection applied to a `with` result, e.g. `rows[*].arn`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// Wrap the resolved value in a single-element array.
  #[serde(default)]
  pub expects_array: bool,
}

impl RuntimeRef {
  /// Name the value is published under: `input.region`, `with.buckets`.
  pub fn dependency_name(&self) -> String {
    format!("{}.{}", self.kind.prefix(), self.name)
  }
}

impl fmt::Display for RuntimeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.path {
      Some(path) => write!(f, "{}.{}", self.dependency_name(), path),
      None => f.write_str(&self.dependency_name()),
    }
  }
}

/// A bound argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
  Static(serde_json::Value),
  Runtime(RuntimeRef),
}

impl ArgValue {
  pub fn as_runtime(&self) -> Option<&RuntimeRef> {
    match self {
      Self::Runtime(reference) => Some(reference),
      Self::Static(_) => None,
    }
  }
}

/// SQL text with its arguments in parameter order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuery {
  pub sql: String,
  pub args: Vec<ArgValue>,
}

impl ResolvedQuery {
  pub fn runtime_refs(&self) -> impl Iterator<Item = &RuntimeRef> {
    self.args.iter().filter_map(ArgValue::as_runtime)
  }

  /// Argument values when none depends on another node.
  pub fn static_args(&self) -> Option<Vec<serde_json::Value>> {
    self
      .args
      .iter()
      .map(|arg| match arg {
        ArgValue::Static(value) => Some(value.clone()),
        ArgValue::Runtime(_) => None,
      })
      .collect()
  }
}
