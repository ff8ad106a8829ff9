//! Control execution events and notifiers.
//!
//! Events let a caller follow a control tree's progress without polling
//! it: render progress bars, stream to a UI, or republish them inside a
//! dashboard.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::summary::StatusSummary;

/// Events emitted while a control tree executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlEvent {
  ExecutionStarted {
    execution_id: String,
    total_controls: usize,
  },

  ControlStarted {
    execution_id: String,
    control: String,
  },

  ControlCompleted {
    execution_id: String,
    control: String,
    summary: StatusSummary,
  },

  ControlFailed {
    execution_id: String,
    control: String,
    error: String,
  },

  /// The tree drained; `error` is set when the tree itself failed.
  ExecutionCompleted {
    execution_id: String,
    summary: StatusSummary,
    error: Option<String>,
  },
}

/// Receives control events.
pub trait ControlNotifier: Send + Sync {
  fn notify(&self, event: ControlEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ControlNotifier for NoopNotifier {
  fn notify(&self, _event: ControlEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ControlEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ControlEvent>) -> Self {
    Self { sender }
  }
}

impl ControlNotifier for ChannelNotifier {
  fn notify(&self, event: ControlEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
