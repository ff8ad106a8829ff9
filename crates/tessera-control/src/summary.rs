//! Control outcome counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of one control result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
  Ok,
  Alarm,
  Info,
  Skip,
  Error,
}

impl ControlStatus {
  /// Order in which finalised rows are grouped.
  pub const PRIORITY: [ControlStatus; 5] = [
    ControlStatus::Error,
    ControlStatus::Alarm,
    ControlStatus::Info,
    ControlStatus::Ok,
    ControlStatus::Skip,
  ];

  /// Position in [`ControlStatus::PRIORITY`].
  pub fn priority(&self) -> usize {
    match self {
      Self::Error => 0,
      Self::Alarm => 1,
      Self::Info => 2,
      Self::Ok => 3,
      Self::Skip => 4,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Ok => "ok",
      Self::Alarm => "alarm",
      Self::Info => "info",
      Self::Skip => "skip",
      Self::Error => "error",
    }
  }
}

impl FromStr for ControlStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ok" => Ok(Self::Ok),
      "alarm" => Ok(Self::Alarm),
      "info" => Ok(Self::Info),
      "skip" => Ok(Self::Skip),
      "error" => Ok(Self::Error),
      other => Err(other.to_string()),
    }
  }
}

impl fmt::Display for ControlStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Outcome counts for a control or any group of controls.
///
/// Merging is a pointwise sum, so the order in which children report does not
/// affect a group's totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
  pub ok: u64,
  pub alarm: u64,
  pub info: u64,
  pub skip: u64,
  pub error: u64,
}

impl StatusSummary {
  pub fn record(&mut self, status: ControlStatus) {
    match status {
      ControlStatus::Ok => self.ok += 1,
      ControlStatus::Alarm => self.alarm += 1,
      ControlStatus::Info => self.info += 1,
      ControlStatus::Skip => self.skip += 1,
      ControlStatus::Error => self.error += 1,
    }
  }

  pub fn merge(&mut self, other: &StatusSummary) {
    self.ok += other.ok;
    self.alarm += other.alarm;
    self.info += other.info;
    self.skip += other.skip;
    self.error += other.error;
  }

  pub fn passed(&self) -> u64 {
    self.ok + self.info
  }

  pub fn failed(&self) -> u64 {
    self.alarm + self.error
  }

  pub fn total(&self) -> u64 {
    self.ok + self.alarm + self.info + self.skip + self.error
  }
}

impl std::ops::Add for StatusSummary {
  type Output = StatusSummary;

  fn add(mut self, rhs: StatusSummary) -> StatusSummary {
    self.merge(&rhs);
    self
  }
}

impl std::iter::Sum for StatusSummary {
  fn sum<I: Iterator<Item = StatusSummary>>(iter: I) -> Self {
    iter.fold(StatusSummary::default(), |acc, s| acc + s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_derived_counts() {
    let summary = StatusSummary {
      ok: 3,
      alarm: 2,
      info: 1,
      skip: 4,
      error: 1,
    };
    assert_eq!(summary.passed(), 4);
    assert_eq!(summary.failed(), 3);
    assert_eq!(summary.total(), 11);
  }

  #[test]
  fn test_merge_is_commutative() {
    let a = StatusSummary {
      ok: 1,
      alarm: 2,
      ..Default::default()
    };
    let b = StatusSummary {
      skip: 5,
      error: 1,
      ..Default::default()
    };
    assert_eq!(a + b, b + a);
    assert_eq!([a, b].into_iter().sum::<StatusSummary>().total(), 9);
  }

  #[test]
  fn test_status_parse_and_priority() {
    assert_eq!("alarm".parse::<ControlStatus>(), Ok(ControlStatus::Alarm));
    assert_eq!("pass".parse::<ControlStatus>(), Err("pass".to_string()));
    for (index, status) in ControlStatus::PRIORITY.iter().enumerate() {
      assert_eq!(status.priority(), index);
    }
  }
}
