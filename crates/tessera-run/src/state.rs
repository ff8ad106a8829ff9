//! Watchable status and error shared by one run node.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::status::RunStatus;

/// Status and error of a run node.
///
/// All transitions go through one lock so the status and the stored error are
/// always observed together. Status changes are broadcast on a watch channel;
/// [`RunState::wait_terminal`] is how a parent or a tree waits for a node.
pub struct RunState<E> {
  status: watch::Sender<RunStatus>,
  error: Mutex<Option<E>>,
}

impl<E: Clone> RunState<E> {
  pub fn new(initial: RunStatus) -> Self {
    let (status, _) = watch::channel(initial);
    Self {
      status,
      error: Mutex::new(None),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Option<E>> {
    self.error.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn status(&self) -> RunStatus {
    *self.status.borrow()
  }

  pub fn error(&self) -> Option<E> {
    self.lock().clone()
  }

  /// True once the node reached a terminal status.
  pub fn is_complete(&self) -> bool {
    self.status().is_terminal()
  }

  pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
    self.status.subscribe()
  }

  /// Move to `next` if the transition is allowed. Returns whether it was.
  pub fn set_status(&self, next: RunStatus) -> bool {
    let _guard = self.lock();
    let current = self.status();
    if !current.can_transition_to(next) {
      return false;
    }
    self.status.send_replace(next);
    true
  }

  /// Record `error` and move to `Error`. Ignored once the node is terminal.
  pub fn set_error(&self, error: E) -> bool {
    let mut guard = self.lock();
    if !self.status().can_transition_to(RunStatus::Error) {
      return false;
    }
    *guard = Some(error);
    self.status.send_replace(RunStatus::Error);
    true
  }

  pub fn set_complete(&self) -> bool {
    self.set_status(RunStatus::Complete)
  }

  /// Force the node back to `status`, clearing any error.
  pub fn reset(&self, status: RunStatus) {
    let mut guard = self.lock();
    *guard = None;
    self.status.send_replace(status);
  }

  /// Wait until the node reaches a terminal status.
  pub async fn wait_terminal(&self) -> RunStatus {
    let mut receiver = self.status.subscribe();
    match receiver.wait_for(|status| status.is_terminal()).await {
      Ok(status) => *status,
      Err(_) => self.status(),
    }
  }
}
