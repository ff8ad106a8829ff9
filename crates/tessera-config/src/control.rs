use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arg::ArgDef;

/// A single policy check. Its query yields `status`, `resource` and `reason`
/// columns, plus any number of dimension columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  /// Name of a [`QueryDef`] to run instead of inline `sql`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(default)]
  pub args: Vec<ArgDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub search_path: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub search_path_prefix: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub severity: Option<String>,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
}

impl ControlDef {
  pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      title: None,
      description: None,
      sql: Some(sql.into()),
      query: None,
      args: Vec::new(),
      search_path: None,
      search_path_prefix: None,
      severity: None,
      tags: BTreeMap::new(),
    }
  }

  pub fn display_title(&self) -> &str {
    self.title.as_deref().unwrap_or(&self.name)
  }
}

/// A named grouping of controls and nested benchmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
  /// Names of child controls and benchmarks, in display order.
  #[serde(default)]
  pub children: Vec<String>,
}

impl BenchmarkDef {
  pub fn new(name: impl Into<String>, children: Vec<String>) -> Self {
    Self {
      name: name.into(),
      title: None,
      description: None,
      tags: BTreeMap::new(),
      children,
    }
  }

  pub fn display_title(&self) -> &str {
    self.title.as_deref().unwrap_or(&self.name)
  }
}

/// A reusable parameterised query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDef {
  pub name: String,
  pub sql: String,
  #[serde(default)]
  pub params: Vec<ParamDef>,
}

/// A declared query or dashboard parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}
