use std::sync::Arc;

use tessera_config::{ExecutionConfig, ResourceProvider};
use tessera_query::{ConnectionReadiness, QueryClient};

use crate::events::{DashboardEvent, DashboardNotifier, NodeSnapshot};

/// Shared by every node of one dashboard execution tree.
pub(crate) struct DashboardContext {
  pub(crate) execution_id: String,
  pub(crate) session_id: String,
  pub(crate) client: Arc<dyn QueryClient>,
  pub(crate) provider: Arc<dyn ResourceProvider>,
  pub(crate) readiness: Arc<dyn ConnectionReadiness>,
  pub(crate) config: ExecutionConfig,
  pub(crate) notifier: Arc<dyn DashboardNotifier>,
}

impl DashboardContext {
  pub(crate) fn notify(&self, event: DashboardEvent) {
    self.notifier.notify(event);
  }

  /// Report a node's new state: an error event if it failed, an update
  /// otherwise.
  pub(crate) fn node_changed(&self, node: NodeSnapshot) {
    let event = match node.error.clone() {
      Some(error) => DashboardEvent::NodeError {
        execution_id: self.execution_id.clone(),
        session_id: self.session_id.clone(),
        node,
        error,
      },
      None => DashboardEvent::NodeUpdated {
        execution_id: self.execution_id.clone(),
        session_id: self.session_id.clone(),
        node,
      },
    };
    self.notify(event);
  }
}
