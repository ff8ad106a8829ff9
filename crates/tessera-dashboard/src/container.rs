//! The dashboard itself and the containers that group its panels.

use std::sync::Arc;

use tessera_run::{RunState, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::context::DashboardContext;
use crate::error::DashboardError;
use crate::events::{NodeSnapshot, NodeType};
use crate::leaf::LeafRun;
use crate::node::{RunNode, launch};

/// A dashboard or container: runs its withs and children concurrently and
/// completes once all of them are terminal.
pub struct ContainerRun {
  name: String,
  title: Option<String>,
  node_type: NodeType,
  parent: Option<String>,
  children: Vec<RunNode>,
  withs: Vec<Arc<LeafRun>>,
  initial: RunStatus,
  context: Arc<DashboardContext>,
  state: RunState<DashboardError>,
}

impl ContainerRun {
  pub(crate) fn new(
    name: String,
    title: Option<String>,
    node_type: NodeType,
    parent: Option<String>,
    children: Vec<RunNode>,
    withs: Vec<Arc<LeafRun>>,
    context: Arc<DashboardContext>,
  ) -> Self {
    let initial = if withs.is_empty() && children.iter().all(RunNode::is_complete) {
      RunStatus::Complete
    } else {
      RunStatus::Initialized
    };
    Self {
      name,
      title,
      node_type,
      parent,
      children,
      withs,
      initial,
      context,
      state: RunState::new(initial),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn node_type(&self) -> NodeType {
    self.node_type
  }

  pub fn parent(&self) -> Option<&str> {
    self.parent.as_deref()
  }

  pub fn status(&self) -> RunStatus {
    self.state.status()
  }

  pub fn error(&self) -> Option<DashboardError> {
    self.state.error()
  }

  pub async fn wait_terminal(&self) -> RunStatus {
    self.state.wait_terminal().await
  }

  pub fn children(&self) -> &[RunNode] {
    &self.children
  }

  pub fn withs(&self) -> &[Arc<LeafRun>] {
    &self.withs
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    NodeSnapshot {
      name: self.name.clone(),
      title: self.title.clone(),
      node_type: self.node_type,
      display: None,
      text: None,
      status: self.status(),
      error: self.error().map(|e| e.to_string()),
      children: self
        .children
        .iter()
        .map(|child| child.name().to_string())
        .collect(),
      dependencies: Vec::new(),
      data: None,
      summary: None,
    }
  }

  pub(crate) fn reset(&self) {
    self.state.reset(self.initial);
  }

  pub(crate) fn fail(&self, error: DashboardError) {
    if self.state.set_error(error) {
      self.context.node_changed(self.snapshot());
    }
  }

  fn nested(&self) -> Vec<RunNode> {
    self
      .withs
      .iter()
      .cloned()
      .map(RunNode::Leaf)
      .chain(self.children.iter().cloned())
      .collect()
  }

  #[instrument(
    name = "dashboard_container",
    skip_all,
    fields(
      execution_id = %self.context.execution_id,
      node = %self.name,
    )
  )]
  pub(crate) async fn execute(self: Arc<Self>, cancel: CancellationToken) {
    if !self.state.set_status(RunStatus::Running) {
      return;
    }
    self.context.node_changed(self.snapshot());

    let errors = launch(self.nested(), &cancel).wait().await;
    self.settle(errors);
  }

  /// Recompute this container's outcome from its children after some of
  /// them were re-executed.
  pub(crate) fn reaggregate(&self) {
    if self.initial.is_terminal() {
      return;
    }
    let errors = self.nested().iter().filter_map(RunNode::error).collect();
    self.state.reset(RunStatus::Running);
    self.settle(errors);
  }

  fn settle(&self, errors: Vec<DashboardError>) {
    let settled = match DashboardError::combine(errors) {
      None => {
        debug!(node = %self.name, "node_completed");
        self.state.set_complete()
      }
      Some(e) => {
        error!(node = %self.name, error = %e, "node_failed");
        self.state.set_error(e)
      }
    };
    if settled {
      self.context.node_changed(self.snapshot());
    }
  }
}
