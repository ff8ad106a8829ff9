//! The dashboard execution tree: execution, input changes and cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tessera_config::ResourceProvider;
use tessera_query::QueryClient;
use tessera_run::{RunStatus, catch_panic};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::builder::DashboardTreeBuilder;
use crate::container::ContainerRun;
use crate::context::DashboardContext;
use crate::dependency::{DependencyPublisher, DependencyValue};
use crate::error::{DashboardError, DependencyError};
use crate::events::{DashboardEvent, NodeSnapshot, NodeType};
use crate::node::{RunNode, launch};

/// Everything the builder hands over.
pub(crate) struct TreeParts {
  pub(crate) dashboard: String,
  pub(crate) root: Arc<ContainerRun>,
  pub(crate) nodes: BTreeMap<String, RunNode>,
  pub(crate) context: Arc<DashboardContext>,
  pub(crate) variables: Arc<DependencyPublisher>,
  pub(crate) inputs: BTreeSet<String>,
  pub(crate) params: BTreeMap<String, Option<Value>>,
  pub(crate) input_dependents: BTreeMap<String, BTreeSet<String>>,
  pub(crate) with_dependents: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct TreeState {
  /// Current input values.
  inputs: BTreeMap<String, Value>,
  executing: bool,
  executed: bool,
  /// Nodes that consumed an outdated value while the tree was executing.
  deferred: BTreeSet<String>,
  cancel: Option<CancellationToken>,
  start_time: Option<DateTime<Utc>>,
  /// When the tree last finished executing or re-running.
  end_time: Option<DateTime<Utc>>,
}

/// One dashboard execution for one client session.
///
/// The tree is executed once. Afterwards, input changes re-execute only the
/// nodes that consumed the old value.
pub struct DashboardExecutionTree {
  parts: TreeParts,
  state: Mutex<TreeState>,
  /// True while neither an execution nor a re-run is in flight.
  idle: watch::Sender<bool>,
}

impl DashboardExecutionTree {
  pub fn builder(
    client: Arc<dyn QueryClient>,
    provider: Arc<dyn ResourceProvider>,
  ) -> DashboardTreeBuilder {
    DashboardTreeBuilder::new(client, provider)
  }

  pub(crate) fn new(parts: TreeParts) -> Self {
    Self {
      parts,
      state: Mutex::new(TreeState::default()),
      idle: watch::channel(true).0,
    }
  }

  fn lock(&self) -> MutexGuard<'_, TreeState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn execution_id(&self) -> &str {
    &self.parts.context.execution_id
  }

  pub fn session_id(&self) -> &str {
    &self.parts.context.session_id
  }

  pub fn dashboard(&self) -> &str {
    &self.parts.dashboard
  }

  pub fn root(&self) -> &Arc<ContainerRun> {
    &self.parts.root
  }

  pub fn node(&self, name: &str) -> Option<&RunNode> {
    self.parts.nodes.get(name)
  }

  pub fn nodes(&self) -> &BTreeMap<String, RunNode> {
    &self.parts.nodes
  }

  pub fn status(&self) -> RunStatus {
    self.parts.root.status()
  }

  pub fn error(&self) -> Option<DashboardError> {
    self.parts.root.error()
  }

  pub fn start_time(&self) -> Option<DateTime<Utc>> {
    self.lock().start_time
  }

  pub fn end_time(&self) -> Option<DateTime<Utc>> {
    self.lock().end_time
  }

  pub fn inputs(&self) -> BTreeMap<String, Value> {
    self.lock().inputs.clone()
  }

  pub fn snapshot(&self) -> BTreeMap<String, NodeSnapshot> {
    self
      .parts
      .nodes
      .iter()
      .map(|(name, node)| (name.clone(), node.snapshot()))
      .collect()
  }

  /// Inputs some node depends on; a non-interactive run needs all of them.
  pub fn input_runtime_dependencies(&self) -> Vec<String> {
    self.parts.input_dependents.keys().cloned().collect()
  }

  /// Every runtime dependency name referenced in the tree.
  pub fn runtime_dependencies(&self) -> Vec<String> {
    let names: BTreeSet<String> = self
      .parts
      .nodes
      .values()
      .filter_map(|node| match node {
        RunNode::Leaf(leaf) => Some(leaf.dependencies().map(|d| d.name()).collect::<Vec<_>>()),
        _ => None,
      })
      .flatten()
      .collect();
    names.into_iter().collect()
  }

  /// Execute the dashboard until every node is terminal.
  ///
  /// Node failures are recorded on the nodes and reported in events; the
  /// returned error covers the tree itself: a node that failed to
  /// initialise, an unready backend, or cancellation.
  #[instrument(
    name = "dashboard_execute",
    skip_all,
    fields(
      execution_id = %self.parts.context.execution_id,
      dashboard = %self.parts.dashboard,
    )
  )]
  pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), DashboardError> {
    let token = {
      let mut state = self.lock();
      if state.executing || state.executed {
        return Err(DashboardError::AlreadyExecuted);
      }
      self.set_executing(&mut state, true);
      state.start_time = Some(Utc::now());
      let token = cancel.child_token();
      state.cancel = Some(token.clone());
      token
    };
    info!(
      execution_id = %self.parts.context.execution_id,
      dashboard = %self.parts.dashboard,
      nodes = self.parts.nodes.len(),
      "execution_started"
    );

    let result = self.execute_inner(&token).await;
    match &result {
      Ok(()) => {
        info!(
          execution_id = %self.parts.context.execution_id,
          status = %self.status(),
          "execution_completed"
        );
        self.notify_completed();
      }
      Err(e) => {
        error!(execution_id = %self.parts.context.execution_id, error = %e, "execution_failed");
        {
          let mut state = self.lock();
          self.set_executing(&mut state, false);
        }
        self.parts.context.notify(DashboardEvent::ExecutionError {
          execution_id: self.parts.context.execution_id.clone(),
          session_id: self.parts.context.session_id.clone(),
          dashboard: self.parts.dashboard.clone(),
          error: e.to_string(),
        });
      }
    }
    result
  }

  async fn execute_inner(&self, cancel: &CancellationToken) -> Result<(), DashboardError> {
    let root = RunNode::Container(Arc::clone(&self.parts.root));
    if let Err(e) = root.initialise(cancel).await {
      root.fail(e.clone());
      return Err(e);
    }

    let context = &self.parts.context;
    if let Some(search_path) = context.config.effective_search_path() {
      match context.readiness.wait_for_search_path(&search_path, cancel).await {
        Ok(()) => {}
        Err(e) if e.is_relation_not_found() => {
          warn!(error = %e, "readiness_check_unsupported");
        }
        Err(e) => {
          let error = DashboardError::from(e);
          root.fail(error.clone());
          return Err(error);
        }
      }
    }

    self.publish_variables();
    context.notify(DashboardEvent::ExecutionStarted {
      execution_id: context.execution_id.clone(),
      session_id: context.session_id.clone(),
      dashboard: self.parts.dashboard.clone(),
      nodes: self.snapshot(),
      dependencies: self.runtime_dependencies(),
      inputs: self.inputs(),
    });

    if let Err(message) = catch_panic(root.execute(cancel.clone())).await {
      root.fail(DashboardError::Panicked {
        node: self.parts.dashboard.clone(),
        message,
      });
    }
    self.drain_deferred(cancel).await;

    if cancel.is_cancelled() {
      return Err(DashboardError::Cancelled);
    }
    Ok(())
  }

  /// Set input values.
  ///
  /// Nodes still waiting on an input receive the new value directly. Nodes
  /// that already consumed an older value, and everything downstream of them
  /// through withs, are re-executed: right away if the tree is idle, after
  /// the current execution otherwise.
  pub async fn set_input_values(
    &self,
    values: BTreeMap<String, Value>,
  ) -> Result<(), DashboardError> {
    if let Some(name) = values.keys().find(|name| !self.parts.inputs.contains(*name)) {
      return Err(DashboardError::invalid(format!(
        "dashboard '{}' has no input '{name}'",
        self.parts.dashboard
      )));
    }

    // stale nodes to re-run now, if the tree is idle
    let rerun = {
      let mut state = self.lock();
      let changed: Vec<(String, Value)> = values
        .into_iter()
        .filter(|(name, value)| state.inputs.get(name) != Some(value))
        .collect();
      for (name, value) in &changed {
        state.inputs.insert(name.clone(), value.clone());
      }
      if changed.is_empty() || !(state.executing || state.executed) {
        return Ok(());
      }

      let mut stale = BTreeSet::new();
      for (name, value) in changed {
        info!(input = %name, "input_changed");
        let delivered: BTreeSet<String> = self
          .parts
          .variables
          .publish(&format!("input.{name}"), Ok(DependencyValue::Scalar(value)))
          .into_iter()
          .collect();
        if let Some(dependents) = self.parts.input_dependents.get(&name) {
          stale.extend(dependents.difference(&delivered).cloned());
        }
      }
      self.expand_stale(&mut stale);

      if state.executing {
        state.deferred.extend(stale);
        None
      } else {
        self.set_executing(&mut state, true);
        let token = state.cancel.clone().unwrap_or_default();
        Some((token, stale))
      }
    };

    if let Some((cancel, stale)) = rerun {
      self.rerun(stale, &cancel).await;
      self.drain_deferred(&cancel).await;
      self.notify_completed();
    }
    Ok(())
  }

  /// Cancel a running execution or re-run and wait for the dashboard to
  /// settle.
  pub async fn cancel(&self) {
    let (token, executing) = {
      let state = self.lock();
      (state.cancel.clone(), state.executing)
    };
    let Some(token) = token else {
      return;
    };
    if !executing && self.parts.root.status().is_terminal() {
      return;
    }
    info!(execution_id = %self.parts.context.execution_id, "execution_cancelled");
    token.cancel();
    self.parts.root.wait_terminal().await;
    // a re-run settles its nodes after the root is already terminal
    let mut idle = self.idle.subscribe();
    let _ = idle.wait_for(|idle| *idle).await;
  }

  fn set_executing(&self, state: &mut TreeState, executing: bool) {
    state.executing = executing;
    if !executing {
      state.executed = true;
      state.end_time = Some(Utc::now());
    }
    self.idle.send_replace(!executing);
  }

  /// Publish the current inputs and params to whoever is subscribed.
  fn publish_variables(&self) {
    let inputs = self.inputs();
    let variables = &self.parts.variables;
    for (name, value) in inputs {
      variables.publish(&format!("input.{name}"), Ok(DependencyValue::Scalar(value)));
    }
    for (name, value) in &self.parts.params {
      let name = format!("param.{name}");
      let value = match value {
        Some(value) => Ok(DependencyValue::Scalar(value.clone())),
        None => Err(DependencyError::Missing { name: name.clone() }),
      };
      variables.publish(&name, value);
    }
  }

  /// Add everything that consumed a stale with's result.
  fn expand_stale(&self, stale: &mut BTreeSet<String>) {
    let mut pending: Vec<String> = stale.iter().cloned().collect();
    while let Some(name) = pending.pop() {
      let is_with = matches!(
        self.parts.nodes.get(&name),
        Some(node) if node.node_type() == NodeType::With
      );
      if !is_with {
        continue;
      }
      for dependent in self.parts.with_dependents.get(&name).into_iter().flatten() {
        if stale.insert(dependent.clone()) {
          pending.push(dependent.clone());
        }
      }
    }
  }

  async fn drain_deferred(&self, cancel: &CancellationToken) {
    loop {
      let stale = {
        let mut state = self.lock();
        if state.deferred.is_empty() {
          self.set_executing(&mut state, false);
          return;
        }
        std::mem::take(&mut state.deferred)
      };
      self.rerun(stale, cancel).await;
    }
  }

  /// Re-execute stale nodes in place.
  ///
  /// Each stale node is re-run through its top-most leaf ancestor, since
  /// a leaf's data includes its children's. The re-run subtrees are reset
  /// and resubscribed, current variables and settled with results are
  /// published to them, and their containers re-aggregate afterwards.
  async fn rerun(&self, stale: BTreeSet<String>, cancel: &CancellationToken) {
    let targets = self.rerun_targets(&stale);
    if targets.is_empty() {
      return;
    }
    info!(
      nodes = ?targets.iter().map(RunNode::name).collect::<Vec<_>>(),
      "nodes_rerun"
    );

    for target in &targets {
      target.reset();
    }
    self.publish_variables();
    for node in self.parts.nodes.values() {
      if let RunNode::Leaf(leaf) = node
        && leaf.node_type() == NodeType::With
        && leaf.status().is_terminal()
      {
        leaf.publish_result();
      }
    }

    launch(targets.clone(), cancel).wait().await;
    self.reaggregate(&targets);
  }

  fn rerun_targets(&self, stale: &BTreeSet<String>) -> Vec<RunNode> {
    let nodes = &self.parts.nodes;
    let mut targets = BTreeMap::new();
    for name in stale {
      let Some(mut node) = nodes.get(name) else {
        continue;
      };
      while let Some(parent) = node.parent().and_then(|parent| nodes.get(parent))
        && matches!(parent, RunNode::Leaf(_))
      {
        node = parent;
      }
      targets.insert(node.name().to_string(), node.clone());
    }

    targets
      .values()
      .filter(|node| !self.has_ancestor_in(node, &targets))
      .cloned()
      .collect()
  }

  fn has_ancestor_in(&self, node: &RunNode, targets: &BTreeMap<String, RunNode>) -> bool {
    let mut current = node.parent();
    while let Some(name) = current {
      if targets.contains_key(name) {
        return true;
      }
      current = self.parts.nodes.get(name).and_then(RunNode::parent);
    }
    false
  }

  /// Recompute container outcomes above re-run nodes, deepest first.
  fn reaggregate(&self, targets: &[RunNode]) {
    let mut ancestors: Vec<(usize, String)> = Vec::new();
    for target in targets {
      let mut chain = Vec::new();
      let mut current = target.parent();
      while let Some(name) = current {
        chain.push(name.to_string());
        current = self.parts.nodes.get(name).and_then(RunNode::parent);
      }
      let depth = chain.len();
      for (index, name) in chain.into_iter().enumerate() {
        ancestors.push((depth - index, name));
      }
    }
    ancestors.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    ancestors.dedup();

    for (_, name) in ancestors {
      if let Some(RunNode::Container(container)) = self.parts.nodes.get(&name) {
        container.reaggregate();
      }
    }
  }

  fn notify_completed(&self) {
    let context = &self.parts.context;
    context.notify(DashboardEvent::ExecutionCompleted {
      execution_id: context.execution_id.clone(),
      session_id: context.session_id.clone(),
      dashboard: self.parts.dashboard.clone(),
      nodes: self.snapshot(),
      inputs: self.inputs(),
    });
  }
}
