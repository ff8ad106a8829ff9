//! The run-node hierarchy of a dashboard.
//!
//! ```text
//! dashboard                ContainerRun
//! ├── with                 LeafRun (publishes to its scope)
//! ├── container            ContainerRun
//! │   └── leaf             LeafRun
//! │       └── leaf         LeafRun (rows merged into the parent)
//! ├── input                LeafRun
//! └── check                CheckRun (wraps a control tree)
//! ```
//!
//! Parents only know their children; children name their parent and the tree
//! resolves it through its node registry.

use std::sync::Arc;

use futures::future::BoxFuture;
use tessera_run::{RunStatus, catch_panic};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::check::CheckRun;
use crate::container::ContainerRun;
use crate::error::DashboardError;
use crate::events::{NodeSnapshot, NodeType};
use crate::leaf::LeafRun;

#[derive(Clone)]
pub enum RunNode {
  Container(Arc<ContainerRun>),
  Leaf(Arc<LeafRun>),
  Check(Arc<CheckRun>),
}

impl RunNode {
  pub fn name(&self) -> &str {
    match self {
      Self::Container(node) => node.name(),
      Self::Leaf(node) => node.name(),
      Self::Check(node) => node.name(),
    }
  }

  pub fn node_type(&self) -> NodeType {
    match self {
      Self::Container(node) => node.node_type(),
      Self::Leaf(node) => node.node_type(),
      Self::Check(_) => NodeType::Check,
    }
  }

  /// Name of the parent node; `None` for the dashboard itself.
  pub fn parent(&self) -> Option<&str> {
    match self {
      Self::Container(node) => node.parent(),
      Self::Leaf(node) => Some(node.parent()),
      Self::Check(node) => Some(node.parent()),
    }
  }

  pub fn status(&self) -> RunStatus {
    match self {
      Self::Container(node) => node.status(),
      Self::Leaf(node) => node.status(),
      Self::Check(node) => node.status(),
    }
  }

  pub fn error(&self) -> Option<DashboardError> {
    match self {
      Self::Container(node) => node.error(),
      Self::Leaf(node) => node.error(),
      Self::Check(node) => node.error(),
    }
  }

  pub fn is_complete(&self) -> bool {
    self.status().is_terminal()
  }

  pub async fn wait_terminal(&self) -> RunStatus {
    match self {
      Self::Container(node) => node.wait_terminal().await,
      Self::Leaf(node) => node.wait_terminal().await,
      Self::Check(node) => node.wait_terminal().await,
    }
  }

  pub fn snapshot(&self) -> NodeSnapshot {
    match self {
      Self::Container(node) => node.snapshot(),
      Self::Leaf(node) => node.snapshot(),
      Self::Check(node) => node.snapshot(),
    }
  }

  /// Visible children, in order.
  pub fn children(&self) -> &[RunNode] {
    match self {
      Self::Container(node) => node.children(),
      Self::Leaf(node) => node.children(),
      Self::Check(_) => &[],
    }
  }

  /// `with` runs declared on this node.
  pub fn withs(&self) -> &[Arc<LeafRun>] {
    match self {
      Self::Container(node) => node.withs(),
      Self::Leaf(node) => node.withs(),
      Self::Check(_) => &[],
    }
  }

  /// Withs first, then children: everything this node launches.
  pub(crate) fn nested(&self) -> Vec<RunNode> {
    self
      .withs()
      .iter()
      .cloned()
      .map(RunNode::Leaf)
      .chain(self.children().iter().cloned())
      .collect()
  }

  pub(crate) fn execute(&self, cancel: CancellationToken) -> BoxFuture<'static, ()> {
    match self {
      Self::Container(node) => Box::pin(Arc::clone(node).execute(cancel)),
      Self::Leaf(node) => Box::pin(Arc::clone(node).execute(cancel)),
      Self::Check(node) => Box::pin(Arc::clone(node).execute(cancel)),
    }
  }

  /// Subscribe to runtime dependencies and build embedded control trees,
  /// depth first.
  pub(crate) fn initialise<'a>(
    &'a self,
    cancel: &'a CancellationToken,
  ) -> BoxFuture<'a, Result<(), DashboardError>> {
    Box::pin(async move {
      match self {
        Self::Leaf(node) => node.subscribe(),
        Self::Check(node) => node.prepare(cancel).await?,
        Self::Container(_) => {}
      }
      for node in self.nested() {
        node.initialise(cancel).await?;
      }
      Ok(())
    })
  }

  /// Return this subtree to its initial state, subscribed afresh.
  pub(crate) fn reset(&self) {
    match self {
      Self::Container(node) => node.reset(),
      Self::Leaf(node) => node.reset(),
      Self::Check(node) => node.reset(),
    }
    for node in self.nested() {
      node.reset();
    }
  }

  pub(crate) fn fail(&self, error: DashboardError) {
    match self {
      Self::Container(node) => node.fail(error),
      Self::Leaf(node) => node.fail(error),
      Self::Check(node) => node.fail(error),
    }
  }
}

/// Children launched by a node, reporting back as they finish.
pub(crate) struct CompletionQueue {
  nodes: Vec<RunNode>,
  receiver: mpsc::UnboundedReceiver<String>,
}

/// Spawn every node as its own task.
///
/// A panic inside a node fails that node; the queue still hears from it.
pub(crate) fn launch(nodes: Vec<RunNode>, cancel: &CancellationToken) -> CompletionQueue {
  let (sender, receiver) = mpsc::unbounded_channel();
  for node in &nodes {
    let node = node.clone();
    let sender = sender.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if let Err(message) = catch_panic(node.execute(cancel)).await {
        node.fail(DashboardError::Panicked {
          node: node.name().to_string(),
          message,
        });
      }
      let _ = sender.send(node.name().to_string());
    });
  }
  CompletionQueue { nodes, receiver }
}

impl CompletionQueue {
  /// Wait for every launched node, then collect the errors of those that
  /// failed.
  pub(crate) async fn wait(mut self) -> Vec<DashboardError> {
    let mut remaining = self.nodes.len();
    while remaining > 0 {
      match self.receiver.recv().await {
        Some(_) => remaining -= 1,
        None => break,
      }
    }
    self.nodes.iter().filter_map(RunNode::error).collect()
  }
}
