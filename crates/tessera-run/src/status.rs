//! Run status and the transitions allowed between statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of one run node.
///
/// ```text
/// Initialized -> (Blocked <-> Running) -> Complete | Error | Canceled
/// ```
///
/// A node with nothing to do starts out `Complete`; nodes with work are
/// created `Initialized`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// Has work and has not started.
  #[doc(alias = "ready")]
  #[default]
  Initialized,
  /// Waiting for a runtime dependency.
  Blocked,
  Running,
  Complete,
  Error,
  Canceled,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Complete | Self::Error | Self::Canceled)
  }

  /// Whether a node in this status may move to `next`.
  ///
  /// Terminal statuses never change; only a reset brings a node back.
  pub fn can_transition_to(&self, next: RunStatus) -> bool {
    match self {
      Self::Initialized => next != Self::Initialized,
      Self::Blocked => next != Self::Initialized && next != Self::Blocked,
      Self::Running => next != Self::Initialized && next != Self::Running,
      Self::Complete | Self::Error | Self::Canceled => false,
    }
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Initialized => "initialized",
      Self::Blocked => "blocked",
      Self::Running => "running",
      Self::Complete => "complete",
      Self::Error => "error",
      Self::Canceled => "canceled",
    };
    f.write_str(name)
  }
}
