//! Serializable snapshots of a control tree.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_run::RunStatus;

use crate::colour::DimensionColours;
use crate::group::{GroupChild, ResultGroup};
use crate::row::ControlRow;
use crate::run::ControlRun;
use crate::summary::StatusSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeReport {
  pub execution_id: String,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub root: GroupReport,
  pub dimension_colours: DimensionColours,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
  pub name: String,
  pub title: String,
  pub summary: StatusSummary,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub severity: BTreeMap<String, StatusSummary>,
  pub duration_ms: u64,
  pub children: Vec<ReportNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportNode {
  Group(GroupReport),
  Control(ControlReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReport {
  pub name: String,
  pub title: String,
  pub status: RunStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub severity: Option<String>,
  pub summary: StatusSummary,
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  pub rows: Vec<ControlRow>,
}

impl GroupReport {
  pub fn from_group(group: &ResultGroup) -> Self {
    Self {
      name: group.name().to_string(),
      title: group.title().to_string(),
      summary: group.summary(),
      severity: group.severity_summary(),
      duration_ms: group.duration().as_millis() as u64,
      children: group
        .children()
        .iter()
        .map(|child| match child {
          GroupChild::Group(group) => ReportNode::Group(GroupReport::from_group(group)),
          GroupChild::Run(run) => ReportNode::Control(ControlReport::from_run(run)),
        })
        .collect(),
    }
  }

  /// Control reports beneath this group, depth first.
  pub fn controls(&self) -> Vec<&ControlReport> {
    let mut controls = Vec::new();
    for child in &self.children {
      match child {
        ReportNode::Control(control) => controls.push(control),
        ReportNode::Group(group) => controls.extend(group.controls()),
      }
    }
    controls
  }
}

impl ControlReport {
  pub fn from_run(run: &ControlRun) -> Self {
    Self {
      name: run.name().to_string(),
      title: run.title().to_string(),
      status: run.status(),
      error: run.error().map(|e| e.to_string()),
      severity: run.control().severity.clone(),
      summary: run.summary(),
      attempts: run.attempts(),
      duration_ms: run.duration().map(|d| d.as_millis() as u64),
      rows: run.rows(),
    }
  }
}
