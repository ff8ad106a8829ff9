//! Control result rows.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tessera_query::{ColumnDef, Row};

use crate::error::ControlError;
use crate::summary::ControlStatus;

const STATUS: &str = "status";
const RESOURCE: &str = "resource";
const REASON: &str = "reason";

/// One classified row of a control's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRow {
  pub resource: String,
  pub status: ControlStatus,
  pub reason: String,
  /// Scalar columns other than the required three.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub dimensions: BTreeMap<String, serde_json::Value>,
}

/// Column layout of a control result, checked once before any row is read.
#[derive(Debug, Clone)]
pub(crate) struct RowSchema {
  status: usize,
  resource: usize,
  reason: usize,
  dimensions: Vec<(usize, String)>,
}

impl RowSchema {
  pub(crate) fn new(control: &str, columns: &[ColumnDef]) -> Result<Self, ControlError> {
    let index = |name: &str| columns.iter().position(|c| c.name == name);
    let (status, resource, reason) = match (index(STATUS), index(RESOURCE), index(REASON)) {
      (Some(status), Some(resource), Some(reason)) => (status, resource, reason),
      (status, resource, reason) => {
        let missing = [(STATUS, status), (RESOURCE, resource), (REASON, reason)]
          .iter()
          .filter(|(_, position)| position.is_none())
          .map(|(name, _)| name.to_string())
          .collect();
        return Err(ControlError::MissingColumns {
          control: control.to_string(),
          missing,
        });
      }
    };

    let dimensions = columns
      .iter()
      .enumerate()
      .filter(|(_, c)| ![STATUS, RESOURCE, REASON].contains(&c.name.as_str()))
      .filter(|(_, c)| !c.data_type.is_json())
      .map(|(i, c)| (i, c.name.clone()))
      .collect();

    Ok(Self {
      status,
      resource,
      reason,
      dimensions,
    })
  }

  pub(crate) fn parse(&self, control: &str, row: &Row) -> Result<ControlRow, ControlError> {
    let cell = |i: usize| row.get(i).cloned().unwrap_or(serde_json::Value::Null);
    let raw_status = text(&cell(self.status));
    let status = raw_status
      .parse::<ControlStatus>()
      .map_err(|status| ControlError::InvalidStatus {
        control: control.to_string(),
        status,
      })?;

    let dimensions = self
      .dimensions
      .iter()
      .filter_map(|(i, name)| {
        let value = cell(*i);
        let scalar = matches!(
          value,
          serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_)
        );
        scalar.then(|| (name.clone(), value))
      })
      .collect();

    Ok(ControlRow {
      resource: text(&cell(self.resource)),
      status,
      reason: text(&cell(self.reason)),
      dimensions,
    })
  }
}

fn text(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    serde_json::Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// Rows bucketed by status, in arrival order within each bucket.
#[derive(Debug, Clone, Default)]
pub(crate) struct RowBuckets {
  buckets: [Vec<ControlRow>; 5],
  dimension_keys: BTreeSet<String>,
}

impl RowBuckets {
  pub(crate) fn push(&mut self, row: ControlRow) {
    self.dimension_keys.extend(row.dimensions.keys().cloned());
    self.buckets[row.status.priority()].push(row);
  }

  pub(crate) fn dimension_keys(&self) -> &BTreeSet<String> {
    &self.dimension_keys
  }

  /// Concatenate the buckets in priority order.
  pub(crate) fn ordered(&self) -> Vec<ControlRow> {
    self.buckets.iter().flatten().cloned().collect()
  }
}
