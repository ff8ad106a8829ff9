//! Dashboard execution events and notifiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_control::StatusSummary;
use tessera_query::SyncResult;
use tessera_run::RunStatus;
use tokio::sync::mpsc;

/// Kind of dashboard node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
  Dashboard,
  Container,
  Leaf,
  With,
  Input,
  Text,
  Check,
}

/// Point-in-time view of one node, as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  pub node_type: NodeType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display: Option<String>,
  /// Body of a text node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  pub status: RunStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Visible children, in order.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<String>,
  /// Runtime dependencies, e.g. `input.region`.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<SyncResult>,
  /// Control outcome counts of a check node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<StatusSummary>,
}

/// Events emitted while a dashboard executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DashboardEvent {
  ExecutionStarted {
    execution_id: String,
    session_id: String,
    dashboard: String,
    nodes: BTreeMap<String, NodeSnapshot>,
    /// Runtime dependency names referenced anywhere in the tree.
    dependencies: Vec<String>,
    inputs: BTreeMap<String, serde_json::Value>,
  },

  NodeUpdated {
    execution_id: String,
    session_id: String,
    node: NodeSnapshot,
  },

  NodeError {
    execution_id: String,
    session_id: String,
    node: NodeSnapshot,
    error: String,
  },

  /// A control inside a check node finished.
  ControlCompleted {
    execution_id: String,
    session_id: String,
    node: String,
    control: String,
    summary: StatusSummary,
  },

  ControlFailed {
    execution_id: String,
    session_id: String,
    node: String,
    control: String,
    error: String,
  },

  ExecutionCompleted {
    execution_id: String,
    session_id: String,
    dashboard: String,
    nodes: BTreeMap<String, NodeSnapshot>,
    inputs: BTreeMap<String, serde_json::Value>,
  },

  ExecutionError {
    execution_id: String,
    session_id: String,
    dashboard: String,
    error: String,
  },
}

/// Receives dashboard events.
pub trait DashboardNotifier: Send + Sync {
  fn notify(&self, event: DashboardEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl DashboardNotifier for NoopNotifier {
  fn notify(&self, _event: DashboardEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<DashboardEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<DashboardEvent>) -> Self {
    Self { sender }
  }
}

impl DashboardNotifier for ChannelNotifier {
  fn notify(&self, event: DashboardEvent) {
    let _ = self.sender.send(event);
  }
}
