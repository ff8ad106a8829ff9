//! Query-bearing dashboard nodes: leaves, withs and inputs, plus text nodes
//! which carry nothing to run.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tessera_query::SyncResult;
use tessera_run::{RunState, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::context::DashboardContext;
use crate::dependency::{
  DependencyPublisher, DependencyValue, RuntimeDependency, stringify_json_columns,
};
use crate::error::{DashboardError, DependencyError};
use crate::events::{NodeSnapshot, NodeType};
use crate::node::{RunNode, launch};

/// One bound argument of a leaf's query.
pub enum LeafArg {
  Static(Value),
  Runtime(Arc<RuntimeDependency>),
}

/// Where a `with` publishes its result.
pub(crate) struct Publication {
  pub(crate) publisher: Arc<DependencyPublisher>,
  /// `with.<name>`
  pub(crate) name: String,
}

pub(crate) struct LeafSpec {
  pub(crate) name: String,
  pub(crate) title: Option<String>,
  pub(crate) node_type: NodeType,
  pub(crate) display: Option<String>,
  pub(crate) text: Option<String>,
  pub(crate) parent: String,
  pub(crate) sql: Option<String>,
  pub(crate) args: Vec<LeafArg>,
  pub(crate) children: Vec<RunNode>,
  pub(crate) withs: Vec<Arc<LeafRun>>,
  pub(crate) publication: Option<Publication>,
}

/// A leaf, with, input or text node.
///
/// Execution launches the node's withs and children, waits for its runtime
/// arguments (status `Blocked`), runs its query, then waits for the children
/// and merges their rows into its own data. A `with` publishes its result, or
/// its error, to its scope once terminal.
pub struct LeafRun {
  spec: LeafSpec,
  initial: RunStatus,
  context: Arc<DashboardContext>,
  state: RunState<DashboardError>,
  data: Mutex<Option<SyncResult>>,
}

impl LeafRun {
  pub(crate) fn new(spec: LeafSpec, context: Arc<DashboardContext>) -> Self {
    // nothing to run: complete from the start
    let initial = if spec.sql.is_none()
      && spec.withs.is_empty()
      && spec.children.iter().all(RunNode::is_complete)
    {
      RunStatus::Complete
    } else {
      RunStatus::Initialized
    };
    Self {
      spec,
      initial,
      context,
      state: RunState::new(initial),
      data: Mutex::new(None),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Option<SyncResult>> {
    self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn name(&self) -> &str {
    &self.spec.name
  }

  pub fn node_type(&self) -> NodeType {
    self.spec.node_type
  }

  pub fn parent(&self) -> &str {
    &self.spec.parent
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
    &self.spec.children
  }

  pub fn withs(&self) -> &[Arc<LeafRun>] {
    &self.spec.withs
  }

  /// Query result, merged with the rows of leaf children.
  pub fn data(&self) -> Option<SyncResult> {
    self.lock().clone()
  }

  pub fn dependencies(&self) -> impl Iterator<Item = &Arc<RuntimeDependency>> {
    self.spec.args.iter().filter_map(|arg| match arg {
      LeafArg::Runtime(dependency) => Some(dependency),
      LeafArg::Static(_) => None,
    })
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    NodeSnapshot {
      name: self.spec.name.clone(),
      title: self.spec.title.clone(),
      node_type: self.spec.node_type,
      display: self.spec.display.clone(),
      text: self.spec.text.clone(),
      status: self.status(),
      error: self.error().map(|e| e.to_string()),
      children: self
        .spec
        .children
        .iter()
        .map(|child| child.name().to_string())
        .collect(),
      dependencies: self.dependencies().map(|d| d.name()).collect(),
      data: self.data(),
      summary: None,
    }
  }

  pub(crate) fn subscribe(&self) {
    for dependency in self.dependencies() {
      dependency.subscribe(&self.spec.name);
    }
  }

  pub(crate) fn reset(&self) {
    self.state.reset(self.initial);
    *self.lock() = None;
    self.subscribe();
  }

  pub(crate) fn fail(&self, error: DashboardError) {
    if self.state.set_error(error) {
      self.context.node_changed(self.snapshot());
      self.publish_result();
    }
  }

  fn transition(&self, status: RunStatus) {
    if self.state.set_status(status) {
      self.context.node_changed(self.snapshot());
    }
  }

  #[instrument(
    name = "dashboard_leaf",
    skip_all,
    fields(
      execution_id = %self.context.execution_id,
      node = %self.spec.name,
    )
  )]
  pub(crate) async fn execute(self: Arc<Self>, cancel: CancellationToken) {
    if self.state.is_complete() {
      self.publish_result();
      return;
    }

    let nested = self
      .spec
      .withs
      .iter()
      .cloned()
      .map(RunNode::Leaf)
      .chain(self.spec.children.iter().cloned())
      .collect();
    let queue = launch(nested, &cancel);

    let mut errors = Vec::new();
    match self.resolve_args(&cancel).await {
      Ok(args) => {
        self.transition(RunStatus::Running);
        if let Some(sql) = &self.spec.sql {
          match self.run_query(sql, &args, &cancel).await {
            Ok(data) => *self.lock() = Some(data),
            Err(e) => errors.push(e),
          }
        }
      }
      Err(e) => errors.push(e),
    }

    errors.extend(queue.wait().await);
    if errors.is_empty() {
      self.merge_child_data();
    }

    let settled = match DashboardError::combine(errors) {
      None => {
        info!(node = %self.spec.name, "node_completed");
        self.state.set_complete()
      }
      Some(e) => {
        error!(node = %self.spec.name, error = %e, "node_failed");
        self.state.set_error(e)
      }
    };
    if settled {
      self.context.node_changed(self.snapshot());
    }
    self.publish_result();
  }

  async fn resolve_args(&self, cancel: &CancellationToken) -> Result<Vec<Value>, DashboardError> {
    if self.dependencies().next().is_some() {
      debug!(
        node = %self.spec.name,
        waiting_on = ?self.dependencies().map(|d| d.name()).collect::<Vec<_>>(),
        "node_blocked"
      );
      self.transition(RunStatus::Blocked);
    }

    let mut values = Vec::with_capacity(self.spec.args.len());
    for arg in &self.spec.args {
      let value = match arg {
        LeafArg::Static(value) => value.clone(),
        LeafArg::Runtime(dependency) => {
          dependency
            .resolve(cancel)
            .await
            .map_err(|source| DashboardError::Dependency {
              node: self.spec.name.clone(),
              reference: dependency.reference().to_string(),
              source,
            })?
        }
      };
      values.push(value);
    }
    Ok(values)
  }

  async fn run_query(
    &self,
    sql: &str,
    args: &[Value],
    cancel: &CancellationToken,
  ) -> Result<SyncResult, DashboardError> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(DashboardError::Cancelled),
      result = self.context.client.execute_sync(sql, args, cancel) => Ok(result?),
    }
  }

  fn merge_child_data(&self) {
    let child_data: Vec<SyncResult> = self
      .spec
      .children
      .iter()
      .filter_map(|child| match child {
        RunNode::Leaf(leaf) => leaf.data(),
        _ => None,
      })
      .collect();
    if child_data.is_empty() {
      return;
    }
    let mut data = self.lock();
    let own = data.take();
    *data = Some(merge_results(own.into_iter().chain(child_data)));
  }

  /// Publish this with's outcome to its scope. Nothing for other node types.
  pub(crate) fn publish_result(&self) {
    let Some(publication) = &self.spec.publication else {
      return;
    };
    let value = match self.error() {
      Some(e) => Err(DependencyError::Failed {
        name: publication.name.clone(),
        message: e.to_string(),
      }),
      None => Ok(DependencyValue::Table(stringify_json_columns(
        self.data().unwrap_or_default(),
      ))),
    };
    publication.publisher.publish(&publication.name, value);
  }
}

/// Concatenate rows, unioning the column schemas by name. Values missing
/// from a result are null.
pub(crate) fn merge_results(results: impl IntoIterator<Item = SyncResult>) -> SyncResult {
  let mut merged = SyncResult::default();
  for result in results {
    let mut positions = Vec::with_capacity(result.columns.len());
    for column in result.columns {
      let position = match merged.column_index(&column.name) {
        Some(position) => position,
        None => {
          merged.columns.push(column);
          for row in &mut merged.rows {
            row.push(Value::Null);
          }
          merged.columns.len() - 1
        }
      };
      positions.push(position);
    }

    for row in result.rows {
      let mut merged_row = vec![Value::Null; merged.columns.len()];
      for (value, &position) in row.into_iter().zip(&positions) {
        merged_row[position] = value;
      }
      merged.rows.push(merged_row);
    }
  }
  merged
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use tessera_query::{ColumnDef, DataType};

  use super::*;

  #[test]
  fn test_merge_results_unions_columns() {
    let nodes = SyncResult {
      columns: vec![
        ColumnDef::new("id", DataType::Text),
        ColumnDef::new("title", DataType::Text),
      ],
      rows: vec![vec![json!("a"), json!("A")]],
    };
    let edges = SyncResult {
      columns: vec![
        ColumnDef::new("from_id", DataType::Text),
        ColumnDef::new("id", DataType::Text),
      ],
      rows: vec![vec![json!("a"), json!("b")]],
    };

    let merged = merge_results([nodes, edges]);
    let names: Vec<_> = merged.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "title", "from_id"]);
    assert_eq!(
      merged.rows,
      vec![
        vec![json!("a"), json!("A"), json!(null)],
        vec![json!("b"), json!(null), json!("a")],
      ]
    );
  }
}
