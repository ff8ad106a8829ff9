//! Engine settings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Settings shared by the control and dashboard execution trees.
///
/// Every field has a default, so a partial `config.json` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
  /// Maximum number of controls running at once across a whole tree.
  pub max_parallel: usize,
  /// Total session acquisition attempts per control run.
  pub session_acquire_attempts: u32,
  /// Wait between session acquisition attempts.
  pub session_retry_backoff_ms: u64,
  /// Total executions of a control's query when the backend connection faults.
  pub control_attempts: u32,
  pub control_timeout_ms: Option<u64>,
  /// Grace period for in-flight runs to unwind after cancellation.
  pub drain_timeout_ms: u64,
  pub search_path: Option<Vec<String>>,
  pub search_path_prefix: Option<Vec<String>>,
  /// Extra filter evaluated against the control introspection view.
  pub where_clause: Option<String>,
  /// Tag filter: tag key to the values a control may carry.
  pub tags: BTreeMap<String, Vec<String>>,
  /// Colours assigned to dimension values after a control run.
  pub dimension_palette: Vec<String>,
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    Self {
      max_parallel: 10,
      session_acquire_attempts: 4,
      session_retry_backoff_ms: 100,
      control_attempts: 3,
      control_timeout_ms: None,
      drain_timeout_ms: 10_000,
      search_path: None,
      search_path_prefix: None,
      where_clause: None,
      tags: BTreeMap::new(),
      dimension_palette: [
        "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
      ]
      .iter()
      .map(|colour| colour.to_string())
      .collect(),
    }
  }
}

impl ExecutionConfig {
  /// Load settings from `path`, falling back to defaults when it is missing.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    if !path.exists() {
      debug!(path = %path.display(), "no execution config, using defaults");
      return Ok(Self::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.display().to_string(),
      message: e.to_string(),
    })
  }

  /// The configured search path with its prefix applied, if either is set.
  pub fn effective_search_path(&self) -> Option<Vec<String>> {
    if self.search_path.is_none() && self.search_path_prefix.is_none() {
      return None;
    }
    let mut path = self.search_path_prefix.clone().unwrap_or_default();
    path.extend(self.search_path.clone().unwrap_or_default());
    Some(path)
  }

  pub fn session_retry_backoff(&self) -> Duration {
    Duration::from_millis(self.session_retry_backoff_ms)
  }

  pub fn control_timeout(&self) -> Option<Duration> {
    self.control_timeout_ms.map(Duration::from_millis)
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let config: ExecutionConfig = serde_json::from_str(r#"{"max_parallel": 2}"#).unwrap();
    assert_eq!(config.max_parallel, 2);
    assert_eq!(config.session_acquire_attempts, 4);
    assert_eq!(config.control_attempts, 3);
    assert_eq!(config.drain_timeout(), Duration::from_secs(10));
    assert!(!config.dimension_palette.is_empty());
  }

  #[test]
  fn test_effective_search_path() {
    let mut config = ExecutionConfig::default();
    assert_eq!(config.effective_search_path(), None);

    config.search_path = Some(vec!["aws".to_string()]);
    config.search_path_prefix = Some(vec!["custom".to_string()]);
    assert_eq!(
      config.effective_search_path(),
      Some(vec!["custom".to_string(), "aws".to_string()])
    );
  }

  #[test]
  fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExecutionConfig::load(&dir.path().join("config.json")).unwrap();
    assert_eq!(config, ExecutionConfig::default());
  }

  #[test]
  fn test_load_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    let error = ExecutionConfig::load(&path).unwrap_err();
    assert!(matches!(error, ConfigError::Parse { .. }));
  }
}
