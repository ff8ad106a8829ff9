//! Dashboard definitions.
//!
//! A dashboard is a tree of nodes. Containers group nodes, leaves and inputs
//! carry queries, checks embed a benchmark or control, and text nodes carry
//! no query at all. Dashboards, containers and leaves may declare `with`
//! sub-queries whose results their descendants reference by name.

use serde::{Deserialize, Serialize};

use crate::arg::ArgDef;
use crate::control::ParamDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default)]
  pub params: Vec<ParamDef>,
  /// Inputs declared at the top of the dashboard.
  #[serde(default)]
  pub inputs: Vec<InputDef>,
  #[serde(default)]
  pub with: Vec<WithDef>,
  #[serde(default)]
  pub children: Vec<NodeDef>,
}

/// A named sub-query whose result other nodes reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(default)]
  pub args: Vec<ArgDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeDef {
  Container(ContainerDef),
  Leaf(LeafDef),
  Input(InputDef),
  Check(CheckDef),
  Text(TextDef),
}

impl NodeDef {
  pub fn name(&self) -> &str {
    match self {
      Self::Container(def) => &def.name,
      Self::Leaf(def) => &def.name,
      Self::Input(def) => &def.name,
      Self::Check(def) => &def.name,
      Self::Text(def) => &def.name,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default)]
  pub with: Vec<WithDef>,
  #[serde(default)]
  pub children: Vec<NodeDef>,
}

/// A query-backed panel (chart, table, graph, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// Display type, e.g. `table`, `chart`, `graph`, `node`, `edge`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(default)]
  pub args: Vec<ArgDef>,
  #[serde(default)]
  pub with: Vec<WithDef>,
  /// Leaf children whose rows are merged into this leaf's data.
  #[serde(default)]
  pub children: Vec<NodeDef>,
}

/// A user-settable value. An input may carry a query listing its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(default)]
  pub args: Vec<ArgDef>,
}

/// Runs a benchmark or control inside the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// Benchmark or control to run.
  pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default)]
  pub value: String,
}
