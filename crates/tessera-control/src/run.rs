//! Execution of a single control.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tessera_config::{ControlDef, ExecutionConfig};
use tessera_query::{QueryError, Session, search_path_statement};
use tessera_run::{RunState, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::context::TreeContext;
use crate::error::ControlError;
use crate::events::ControlEvent;
use crate::group::ResultGroup;
use crate::row::{ControlRow, RowBuckets, RowSchema};
use crate::summary::StatusSummary;

#[derive(Default)]
struct RunData {
  buckets: RowBuckets,
  summary: StatusSummary,
  /// Finalised rows, ordered by status priority.
  rows: Vec<ControlRow>,
  duration: Option<Duration>,
  started_at: Option<DateTime<Utc>>,
  attempts: u32,
}

/// One control's run: session, query, row classification and summary.
pub struct ControlRun {
  control: ControlDef,
  sql: String,
  args: Vec<serde_json::Value>,
  search_path: Option<Vec<String>>,
  parent: Weak<ResultGroup>,
  context: Arc<TreeContext>,
  state: RunState<ControlError>,
  data: Mutex<RunData>,
}

impl ControlRun {
  pub(crate) fn new(
    control: ControlDef,
    sql: String,
    args: Vec<serde_json::Value>,
    parent: Weak<ResultGroup>,
    context: Arc<TreeContext>,
  ) -> Self {
    let search_path = control_search_path(&control, &context.config);
    Self {
      control,
      sql,
      args,
      search_path,
      parent,
      context,
      state: RunState::new(RunStatus::Initialized),
      data: Mutex::new(RunData::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, RunData> {
    self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn name(&self) -> &str {
    &self.control.name
  }

  pub fn title(&self) -> &str {
    self.control.display_title()
  }

  pub fn control(&self) -> &ControlDef {
    &self.control
  }

  pub fn status(&self) -> RunStatus {
    self.state.status()
  }

  pub fn error(&self) -> Option<ControlError> {
    self.state.error()
  }

  /// True once the run reached a terminal status.
  pub fn is_complete(&self) -> bool {
    self.state.is_complete()
  }

  pub async fn wait_terminal(&self) -> RunStatus {
    self.state.wait_terminal().await
  }

  pub fn summary(&self) -> StatusSummary {
    self.lock().summary
  }

  /// Rows grouped by status priority. Empty until the run settles.
  pub fn rows(&self) -> Vec<ControlRow> {
    self.lock().rows.clone()
  }

  pub fn dimension_keys(&self) -> BTreeSet<String> {
    self.lock().buckets.dimension_keys().clone()
  }

  pub fn duration(&self) -> Option<Duration> {
    self.lock().duration
  }

  pub fn started_at(&self) -> Option<DateTime<Utc>> {
    self.lock().started_at
  }

  /// Number of times the query was executed.
  pub fn attempts(&self) -> u32 {
    self.lock().attempts
  }

  /// Execute the control. Does nothing if the run is already terminal.
  #[instrument(
    name = "control_run",
    skip_all,
    fields(
      execution_id = %self.context.execution_id,
      control = %self.control.name,
    )
  )]
  pub async fn execute(self: Arc<Self>, cancel: CancellationToken) {
    if !self.state.set_status(RunStatus::Running) {
      return;
    }
    self.lock().started_at = Some(Utc::now());
    info!(control = %self.control.name, "control_started");
    self.context.notify(ControlEvent::ControlStarted {
      execution_id: self.context.execution_id.clone(),
      control: self.control.name.clone(),
    });

    let started = Instant::now();
    let result = self.run_with_timeout(&cancel).await;
    self.settle(result, started.elapsed());
  }

  /// Force the run to `Error` without executing it, e.g. when the tree is
  /// cancelled before the run got a slot. Returns false if already terminal.
  pub(crate) fn abandon(&self, error: ControlError) -> bool {
    let elapsed = self
      .started_at()
      .and_then(|started| (Utc::now() - started).to_std().ok())
      .unwrap_or_default();
    self.settle(Err(error), elapsed)
  }

  async fn run_with_timeout(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    let Some(timeout) = self.context.config.control_timeout() else {
      return self.run_attempts(cancel).await;
    };

    let run_cancel = cancel.child_token();
    let timer_token = run_cancel.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(timeout) => timer_token.cancel(),
        _ = timer_token.cancelled() => {}
      }
    });

    let result = self.run_attempts(&run_cancel).await;
    let timed_out = run_cancel.is_cancelled() && !cancel.is_cancelled();
    // stops the timer
    run_cancel.cancel();

    match result {
      Err(e) if timed_out && e.is_cancelled() => Err(ControlError::Timeout {
        control: self.control.name.clone(),
        timeout_ms: timeout.as_millis() as u64,
      }),
      other => other,
    }
  }

  /// Execute the whole run, repeating it while the backend connection faults.
  async fn run_attempts(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    let max_attempts = self.context.config.control_attempts.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      {
        let mut data = self.lock();
        data.attempts = attempt;
        data.buckets = RowBuckets::default();
        data.summary = StatusSummary::default();
      }

      match self.execute_once(cancel).await {
        Err(ControlError::Query { source })
          if source.is_connectivity() && attempt < max_attempts && !cancel.is_cancelled() =>
        {
          warn!(
            control = %self.control.name,
            attempt,
            error = %source,
            "control_retry"
          );
        }
        result => return result,
      }
    }
  }

  async fn execute_once(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    let session = self.acquire_session(cancel).await?;
    let result = self.query_in_session(&session, cancel).await;
    let cancelled = cancel.is_cancelled() || result.as_ref().is_err_and(ControlError::is_cancelled);
    self.context.client.close_session(session, cancelled).await;
    result
  }

  async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Session, ControlError> {
    let attempts = self.context.config.session_acquire_attempts.max(1);
    let backoff = self.context.config.session_retry_backoff();
    let mut last_error = None;

    for attempt in 1..=attempts {
      if cancel.is_cancelled() {
        return Err(ControlError::Cancelled);
      }
      match self.context.client.acquire_session(cancel).await {
        Ok(session) => return Ok(session),
        Err(e) if e.is_cancelled() || cancel.is_cancelled() => return Err(ControlError::Cancelled),
        Err(e) if !e.is_transient() => {
          return Err(ControlError::SessionAcquisition {
            attempts: attempt,
            source: e,
          });
        }
        Err(e) => {
          warn!(
            control = %self.control.name,
            attempt,
            error = %e,
            "session_acquire_failed"
          );
          last_error = Some(e);
          if attempt < attempts {
            tokio::select! {
              biased;
              _ = cancel.cancelled() => return Err(ControlError::Cancelled),
              _ = tokio::time::sleep(backoff) => {}
            }
          }
        }
      }
    }

    Err(ControlError::SessionAcquisition {
      attempts,
      source: last_error.unwrap_or_else(|| QueryError::session_acquisition("no attempts made")),
    })
  }

  async fn query_in_session(
    &self,
    session: &Session,
    cancel: &CancellationToken,
  ) -> Result<(), ControlError> {
    let client = &self.context.client;

    if let Some(search_path) = &self.search_path {
      let statement = search_path_statement(search_path);
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ControlError::Cancelled),
        result = async {
          client
            .execute_in_session(session, &statement, &[], cancel)
            .await?
            .collect()
            .await
        } => { result?; }
      }
    }

    let mut result = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(ControlError::Cancelled),
      result = client.execute_in_session(session, &self.sql, &self.args, cancel) => result?,
    };

    let schema = RowSchema::new(&self.control.name, &result.columns)?;

    loop {
      let item = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ControlError::Cancelled),
        item = result.rows.next() => item,
      };
      match item {
        None => return Ok(()),
        Some(Ok(row)) => {
          let row = schema.parse(&self.control.name, &row)?;
          self.record_row(row)?;
        }
        Some(Err(e)) if e.is_cancelled() => return Err(ControlError::Cancelled),
        Some(Err(e)) => return Err(ControlError::Row { source: e }),
      }
    }
  }

  fn record_row(&self, row: ControlRow) -> Result<(), ControlError> {
    let mut data = self.lock();
    // abandoned by the tree while streaming
    if self.state.is_complete() {
      return Err(ControlError::Cancelled);
    }
    data.summary.record(row.status);
    data.buckets.push(row);
    Ok(())
  }

  /// Move to a terminal status and fold the outcome into the parent chain.
  ///
  /// Runs exactly once per execution: the status transition and the summary
  /// update happen under the data lock, and a run that is already terminal
  /// contributes nothing further.
  fn settle(&self, result: Result<(), ControlError>, duration: Duration) -> bool {
    let (summary, dimension_keys) = {
      let mut data = self.lock();
      let transitioned = match &result {
        Ok(()) => self.state.set_complete(),
        Err(e) => self.state.set_error(e.clone()),
      };
      if !transitioned {
        return false;
      }
      if result.is_err() {
        data.summary.error += 1;
      }
      data.rows = data.buckets.ordered();
      data.duration = Some(duration);
      (data.summary, data.buckets.dimension_keys().clone())
    };

    if let Some(parent) = self.parent.upgrade() {
      parent.update_summary(&summary);
      if let Some(severity) = &self.control.severity {
        parent.update_severity_counts(severity, &summary);
      }
      parent.add_dimension_keys(&dimension_keys);
      parent.add_duration(duration);
    }

    match result {
      Ok(()) => {
        info!(
          control = %self.control.name,
          ok = summary.ok,
          alarm = summary.alarm,
          error = summary.error,
          duration_ms = duration.as_millis() as u64,
          "control_completed"
        );
        self.context.notify(ControlEvent::ControlCompleted {
          execution_id: self.context.execution_id.clone(),
          control: self.control.name.clone(),
          summary,
        });
      }
      Err(e) => {
        error!(control = %self.control.name, error = %e, "control_failed");
        self.context.notify(ControlEvent::ControlFailed {
          execution_id: self.context.execution_id.clone(),
          control: self.control.name.clone(),
          error: e.to_string(),
        });
      }
    }
    true
  }
}

/// Search path a control sets on its session, if it overrides the tree's.
fn control_search_path(control: &ControlDef, config: &ExecutionConfig) -> Option<Vec<String>> {
  if control.search_path.is_none() && control.search_path_prefix.is_none() {
    return None;
  }
  let mut path = control.search_path_prefix.clone().unwrap_or_default();
  path.extend(
    control
      .search_path
      .clone()
      .or_else(|| config.effective_search_path())
      .unwrap_or_default(),
  );
  Some(path)
}
