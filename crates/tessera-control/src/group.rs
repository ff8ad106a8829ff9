//! Composite node of the control hierarchy.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tessera_run::catch_panic;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::TreeContext;
use crate::error::ControlError;
use crate::run::ControlRun;
use crate::summary::StatusSummary;

/// A child of a result group, in display order.
#[derive(Clone)]
pub enum GroupChild {
  Group(Arc<ResultGroup>),
  Run(Arc<ControlRun>),
}

#[derive(Default)]
struct GroupData {
  summary: StatusSummary,
  severity: BTreeMap<String, StatusSummary>,
  dimension_keys: BTreeSet<String>,
  duration: Duration,
}

/// A benchmark, a mod, or the synthetic root of a control tree.
///
/// Aggregates are only written by descendant runs as they settle and are
/// propagated up the parent chain, each group updating its own counters
/// under its own lock.
pub struct ResultGroup {
  name: String,
  title: String,
  tags: BTreeMap<String, String>,
  parent: Weak<ResultGroup>,
  children: Vec<GroupChild>,
  context: Arc<TreeContext>,
  data: Mutex<GroupData>,
}

impl ResultGroup {
  pub(crate) fn new(
    name: String,
    title: String,
    tags: BTreeMap<String, String>,
    parent: Weak<ResultGroup>,
    children: Vec<GroupChild>,
    context: Arc<TreeContext>,
  ) -> Self {
    Self {
      name,
      title,
      tags,
      parent,
      children,
      context,
      data: Mutex::new(GroupData::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, GroupData> {
    self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn title(&self) -> &str {
    &self.title
  }

  pub fn tags(&self) -> &BTreeMap<String, String> {
    &self.tags
  }

  pub fn parent(&self) -> Option<Arc<ResultGroup>> {
    self.parent.upgrade()
  }

  pub fn children(&self) -> &[GroupChild] {
    &self.children
  }

  pub fn groups(&self) -> impl Iterator<Item = &Arc<ResultGroup>> {
    self.children.iter().filter_map(|child| match child {
      GroupChild::Group(group) => Some(group),
      GroupChild::Run(_) => None,
    })
  }

  pub fn runs(&self) -> impl Iterator<Item = &Arc<ControlRun>> {
    self.children.iter().filter_map(|child| match child {
      GroupChild::Run(run) => Some(run),
      GroupChild::Group(_) => None,
    })
  }

  /// Every control run beneath this group, depth first.
  pub fn all_runs(&self) -> Vec<Arc<ControlRun>> {
    let mut runs = Vec::new();
    for child in &self.children {
      match child {
        GroupChild::Run(run) => runs.push(Arc::clone(run)),
        GroupChild::Group(group) => runs.extend(group.all_runs()),
      }
    }
    runs
  }

  pub fn summary(&self) -> StatusSummary {
    self.lock().summary
  }

  pub fn severity_summary(&self) -> BTreeMap<String, StatusSummary> {
    self.lock().severity.clone()
  }

  pub fn dimension_keys(&self) -> BTreeSet<String> {
    self.lock().dimension_keys.clone()
  }

  /// Sum of the durations of every settled descendant run.
  pub fn duration(&self) -> Duration {
    self.lock().duration
  }

  /// True once every descendant run is terminal.
  pub fn is_complete(&self) -> bool {
    self.children.iter().all(|child| match child {
      GroupChild::Run(run) => run.is_complete(),
      GroupChild::Group(group) => group.is_complete(),
    })
  }

  pub(crate) fn update_summary(&self, summary: &StatusSummary) {
    self.lock().summary.merge(summary);
    if let Some(parent) = self.parent.upgrade() {
      parent.update_summary(summary);
    }
  }

  pub(crate) fn update_severity_counts(&self, severity: &str, summary: &StatusSummary) {
    self
      .lock()
      .severity
      .entry(severity.to_string())
      .or_default()
      .merge(summary);
    if let Some(parent) = self.parent.upgrade() {
      parent.update_severity_counts(severity, summary);
    }
  }

  pub(crate) fn add_dimension_keys(&self, keys: &BTreeSet<String>) {
    self.lock().dimension_keys.extend(keys.iter().cloned());
    if let Some(parent) = self.parent.upgrade() {
      parent.add_dimension_keys(keys);
    }
  }

  pub(crate) fn add_duration(&self, duration: Duration) {
    self.lock().duration += duration;
    if let Some(parent) = self.parent.upgrade() {
      parent.add_duration(duration);
    }
  }

  /// Launch this group's runs, then recurse into child groups.
  ///
  /// Each run waits for a slot on the tree-wide semaphore and executes as its
  /// own task, so this returns once every run beneath it has been launched,
  /// not once they finish. A run that cannot get a slot before cancellation
  /// is settled as cancelled.
  pub fn execute<'a>(
    &'a self,
    cancel: &'a CancellationToken,
  ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
      debug!(group = %self.name, "group_execute");

      for run in self.runs() {
        if run.is_complete() {
          continue;
        }

        let permit = tokio::select! {
          biased;
          _ = cancel.cancelled() => None,
          permit = Arc::clone(&self.context.semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
          run.abandon(ControlError::Cancelled);
          continue;
        };

        let run = Arc::clone(run);
        let cancel = cancel.clone();
        tokio::spawn(async move {
          let _permit = permit;
          if let Err(message) = catch_panic(Arc::clone(&run).execute(cancel)).await {
            run.abandon(ControlError::Panicked { message });
          }
        });
      }

      for group in self.groups() {
        group.execute(cancel).await;
      }
    })
  }
}
