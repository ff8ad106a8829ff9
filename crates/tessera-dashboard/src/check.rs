//! A benchmark or control embedded in a dashboard.

use std::sync::{Arc, Mutex, MutexGuard};

use tessera_control::{ControlEvent, ControlExecutionTree, ControlNotifier};
use tessera_run::{RunState, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::context::DashboardContext;
use crate::error::DashboardError;
use crate::events::{DashboardEvent, DashboardNotifier, NodeSnapshot, NodeType};

/// Republishes a check's control events as dashboard events.
struct CheckNotifier {
  node: String,
  execution_id: String,
  session_id: String,
  notifier: Arc<dyn DashboardNotifier>,
}

impl ControlNotifier for CheckNotifier {
  fn notify(&self, event: ControlEvent) {
    let event = match event {
      ControlEvent::ControlCompleted {
        control, summary, ..
      } => DashboardEvent::ControlCompleted {
        execution_id: self.execution_id.clone(),
        session_id: self.session_id.clone(),
        node: self.node.clone(),
        control,
        summary,
      },
      ControlEvent::ControlFailed { control, error, .. } => DashboardEvent::ControlFailed {
        execution_id: self.execution_id.clone(),
        session_id: self.session_id.clone(),
        node: self.node.clone(),
        control,
        error,
      },
      _ => return,
    };
    self.notifier.notify(event);
  }
}

/// Runs a control execution tree for one benchmark or control.
///
/// The node fails only if the tree itself fails; individual control
/// failures show up in the summary.
pub struct CheckRun {
  name: String,
  title: Option<String>,
  target: String,
  parent: String,
  context: Arc<DashboardContext>,
  state: RunState<DashboardError>,
  tree: Mutex<Option<Arc<ControlExecutionTree>>>,
}

impl CheckRun {
  pub(crate) fn new(
    name: String,
    title: Option<String>,
    target: String,
    parent: String,
    context: Arc<DashboardContext>,
  ) -> Self {
    Self {
      name,
      title,
      target,
      parent,
      context,
      state: RunState::new(RunStatus::Initialized),
      tree: Mutex::new(None),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Option<Arc<ControlExecutionTree>>> {
    self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn target(&self) -> &str {
    &self.target
  }

  pub fn parent(&self) -> &str {
    &self.parent
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

  /// The embedded control tree, once built.
  pub fn tree(&self) -> Option<Arc<ControlExecutionTree>> {
    self.lock().clone()
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    NodeSnapshot {
      name: self.name.clone(),
      title: self.title.clone(),
      node_type: NodeType::Check,
      display: None,
      text: None,
      status: self.status(),
      error: self.error().map(|e| e.to_string()),
      children: Vec::new(),
      dependencies: Vec::new(),
      data: None,
      summary: self.tree().map(|tree| tree.summary()),
    }
  }

  /// Build the control tree for the target.
  pub(crate) async fn prepare(&self, cancel: &CancellationToken) -> Result<(), DashboardError> {
    let context = &self.context;
    let notifier = Arc::new(CheckNotifier {
      node: self.name.clone(),
      execution_id: context.execution_id.clone(),
      session_id: context.session_id.clone(),
      notifier: Arc::clone(&context.notifier),
    });
    let tree = ControlExecutionTree::builder(Arc::clone(&context.client), Arc::clone(&context.provider))
      .config(context.config.clone())
      .notifier(notifier)
      .build(std::slice::from_ref(&self.target), cancel)
      .await?;
    *self.lock() = Some(Arc::new(tree));
    Ok(())
  }

  pub(crate) fn reset(&self) {
    self.state.reset(RunStatus::Initialized);
    *self.lock() = None;
  }

  pub(crate) fn fail(&self, error: DashboardError) {
    if self.state.set_error(error) {
      self.context.node_changed(self.snapshot());
    }
  }

  #[instrument(
    name = "dashboard_check",
    skip_all,
    fields(
      execution_id = %self.context.execution_id,
      node = %self.name,
      target = %self.target,
    )
  )]
  pub(crate) async fn execute(self: Arc<Self>, cancel: CancellationToken) {
    if self.state.is_complete() {
      return;
    }

    let tree = match self.tree() {
      Some(tree) => tree,
      None => {
        if let Err(e) = self.prepare(&cancel).await {
          self.fail(e);
          return;
        }
        match self.tree() {
          Some(tree) => tree,
          None => return,
        }
      }
    };

    if self.state.set_status(RunStatus::Running) {
      self.context.node_changed(self.snapshot());
    }

    let settled = match tree.execute(&cancel).await {
      Ok(()) => {
        let summary = tree.summary();
        info!(node = %self.name, ok = summary.ok, alarm = summary.alarm, error = summary.error, "check_completed");
        self.state.set_complete()
      }
      Err(e) => {
        error!(node = %self.name, error = %e, "check_failed");
        self.state.set_error(e.into())
      }
    };
    if settled {
      self.context.node_changed(self.snapshot());
    }
  }
}
