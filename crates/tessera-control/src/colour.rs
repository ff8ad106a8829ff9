//! Dimension colour assignment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::run::ControlRun;

/// Colour for every distinct dimension value seen in a tree's rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionColours {
  /// Dimension key to value to colour.
  pub colours: BTreeMap<String, BTreeMap<String, String>>,
}

impl DimensionColours {
  /// Assign palette entries to the sorted (key, value) pairs, wrapping
  /// around the palette.
  pub fn assign(runs: &[Arc<ControlRun>], palette: &[String]) -> Self {
    let mut values: BTreeSet<(String, String)> = BTreeSet::new();
    for run in runs {
      for row in run.rows() {
        for (key, value) in row.dimensions {
          let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
          };
          values.insert((key, value));
        }
      }
    }

    let mut colours: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    if palette.is_empty() {
      return Self { colours };
    }
    for (index, (key, value)) in values.into_iter().enumerate() {
      colours
        .entry(key)
        .or_default()
        .insert(value, palette[index % palette.len()].clone());
    }
    Self { colours }
  }

  pub fn get(&self, key: &str, value: &str) -> Option<&str> {
    self
      .colours
      .get(key)
      .and_then(|values| values.get(value))
      .map(String::as_str)
  }
}
