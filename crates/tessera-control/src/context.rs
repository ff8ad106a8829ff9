use std::sync::Arc;

use tessera_config::ExecutionConfig;
use tessera_query::QueryClient;
use tokio::sync::Semaphore;

use crate::events::{ControlEvent, ControlNotifier};

/// State shared by every node of one control tree.
pub(crate) struct TreeContext {
  pub(crate) execution_id: String,
  pub(crate) client: Arc<dyn QueryClient>,
  pub(crate) config: ExecutionConfig,
  /// Tree-wide cap on concurrently running controls.
  pub(crate) semaphore: Arc<Semaphore>,
  pub(crate) notifier: Arc<dyn ControlNotifier>,
}

impl TreeContext {
  pub(crate) fn notify(&self, event: ControlEvent) {
    self.notifier.notify(event);
  }
}
