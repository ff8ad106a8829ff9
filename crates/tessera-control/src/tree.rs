//! Control execution tree.
//!
//! A tree is built from one or more named resources (controls, benchmarks,
//! the mod, or `all`) under a synthetic root group. Executing it launches
//! every control run under a tree-wide concurrency cap, then drains: the
//! tree only reports completion once no run is in flight.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tessera_config::{ConfigError, ControlDef, ExecutionConfig, ResourceItem, ResourceProvider};
use tessera_query::{AlwaysReady, ConnectionReadiness, QueryClient};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::colour::DimensionColours;
use crate::context::TreeContext;
use crate::error::ControlError;
use crate::events::{ControlEvent, ControlNotifier, NoopNotifier};
use crate::filter::{control_allow_list, filter_clause};
use crate::group::{GroupChild, ResultGroup};
use crate::report::{GroupReport, TreeReport};
use crate::run::ControlRun;
use crate::summary::StatusSummary;

/// Name of the synthetic root group.
pub const ROOT_NAME: &str = "root";

struct PlannedGroup {
  name: String,
  title: String,
  tags: BTreeMap<String, String>,
  children: Vec<Planned>,
}

/// Tree shape with every definition resolved, before any node exists.
enum Planned {
  Group(PlannedGroup),
  Control {
    def: ControlDef,
    sql: String,
    args: Vec<serde_json::Value>,
  },
}

/// Builds a [`ControlExecutionTree`].
pub struct ControlTreeBuilder {
  client: Arc<dyn QueryClient>,
  provider: Arc<dyn ResourceProvider>,
  readiness: Arc<dyn ConnectionReadiness>,
  config: ExecutionConfig,
  notifier: Arc<dyn ControlNotifier>,
}

impl ControlTreeBuilder {
  pub fn new(client: Arc<dyn QueryClient>, provider: Arc<dyn ResourceProvider>) -> Self {
    Self {
      client,
      provider,
      readiness: Arc::new(AlwaysReady),
      config: ExecutionConfig::default(),
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn config(mut self, config: ExecutionConfig) -> Self {
    self.config = config;
    self
  }

  pub fn readiness(mut self, readiness: Arc<dyn ConnectionReadiness>) -> Self {
    self.readiness = readiness;
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn ControlNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Resolve `names` and build the tree.
  ///
  /// A configured where clause or tag filter is evaluated first; controls
  /// outside its allow-list are left out of the tree.
  pub async fn build(
    self,
    names: &[String],
    cancel: &CancellationToken,
  ) -> Result<ControlExecutionTree, ControlError> {
    let allow_list = match filter_clause(&self.config) {
      Some(clause) => Some(control_allow_list(self.client.as_ref(), &clause, cancel).await?),
      None => None,
    };

    let mut children = Vec::with_capacity(names.len());
    for name in names {
      let item = self.provider.resolve(name)?;
      if let Some(planned) = plan(self.provider.as_ref(), item, allow_list.as_ref())? {
        children.push(planned);
      }
    }
    let root = PlannedGroup {
      name: ROOT_NAME.to_string(),
      title: self
        .provider
        .mod_title()
        .unwrap_or(self.provider.mod_name())
        .to_string(),
      tags: BTreeMap::new(),
      children,
    };

    let execution_id = uuid::Uuid::new_v4().to_string();
    let context = Arc::new(TreeContext {
      execution_id: execution_id.clone(),
      client: self.client,
      semaphore: Arc::new(Semaphore::new(self.config.max_parallel.max(1))),
      config: self.config,
      notifier: self.notifier,
    });

    let root = instantiate(root, Weak::new(), &context);
    let runs = root.all_runs();
    info!(
      execution_id = %execution_id,
      controls = runs.len(),
      "control_tree_built"
    );

    Ok(ControlExecutionTree {
      execution_id,
      search_path: context.config.effective_search_path(),
      root,
      runs,
      context,
      readiness: self.readiness,
      times: Mutex::new((None, None)),
      colours: Mutex::new(DimensionColours::default()),
    })
  }
}

fn plan(
  provider: &dyn ResourceProvider,
  item: ResourceItem,
  allow_list: Option<&HashSet<String>>,
) -> Result<Option<Planned>, ControlError> {
  let planned = match item {
    ResourceItem::Control(def) => {
      if let Some(allowed) = allow_list
        && !allowed.contains(&def.name)
      {
        return Ok(None);
      }
      let query = provider.resolve_query(&def.name, def.sql.as_deref(), def.query.as_deref(), &def.args)?;
      let args = query.static_args().ok_or_else(|| ConfigError::InvalidArgument {
        resource: def.name.clone(),
        message: "control arguments cannot depend on runtime values".to_string(),
      })?;
      Planned::Control {
        sql: query.sql,
        args,
        def,
      }
    }
    ResourceItem::Benchmark(def) => {
      let mut children = Vec::new();
      for child in provider.children(&def)? {
        if let Some(planned) = plan(provider, child, allow_list)? {
          children.push(planned);
        }
      }
      Planned::Group(PlannedGroup {
        title: def.display_title().to_string(),
        name: def.name,
        tags: def.tags,
        children,
      })
    }
    ResourceItem::Mod {
      name,
      title,
      children,
    } => {
      let mut planned = Vec::new();
      for child in children {
        if let Some(child) = plan(provider, child, allow_list)? {
          planned.push(child);
        }
      }
      Planned::Group(PlannedGroup {
        title: title.unwrap_or_else(|| name.clone()),
        name,
        tags: BTreeMap::new(),
        children: planned,
      })
    }
    ResourceItem::Dashboard(def) => {
      return Err(
        ConfigError::InvalidResource {
          name: def.name,
          message: "a dashboard cannot be run as a control".to_string(),
        }
        .into(),
      );
    }
  };
  Ok(Some(planned))
}

fn instantiate(
  group: PlannedGroup,
  parent: Weak<ResultGroup>,
  context: &Arc<TreeContext>,
) -> Arc<ResultGroup> {
  Arc::new_cyclic(|this| {
    let children = group
      .children
      .into_iter()
      .map(|child| match child {
        Planned::Group(nested) => GroupChild::Group(instantiate(nested, this.clone(), context)),
        Planned::Control { def, sql, args } => GroupChild::Run(Arc::new(ControlRun::new(
          def,
          sql,
          args,
          this.clone(),
          Arc::clone(context),
        ))),
      })
      .collect();
    ResultGroup::new(
      group.name,
      group.title,
      group.tags,
      parent,
      children,
      Arc::clone(context),
    )
  })
}

type Times = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

/// A result-group/control-run tree and the settings it runs with.
pub struct ControlExecutionTree {
  execution_id: String,
  root: Arc<ResultGroup>,
  runs: Vec<Arc<ControlRun>>,
  context: Arc<TreeContext>,
  readiness: Arc<dyn ConnectionReadiness>,
  search_path: Option<Vec<String>>,
  times: Mutex<Times>,
  colours: Mutex<DimensionColours>,
}

impl ControlExecutionTree {
  pub fn builder(
    client: Arc<dyn QueryClient>,
    provider: Arc<dyn ResourceProvider>,
  ) -> ControlTreeBuilder {
    ControlTreeBuilder::new(client, provider)
  }

  fn times(&self) -> MutexGuard<'_, Times> {
    self.times.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  pub fn root(&self) -> &Arc<ResultGroup> {
    &self.root
  }

  /// Every control run in the tree, depth first.
  pub fn runs(&self) -> &[Arc<ControlRun>] {
    &self.runs
  }

  pub fn run(&self, name: &str) -> Option<&Arc<ControlRun>> {
    self.runs.iter().find(|run| run.name() == name)
  }

  pub fn summary(&self) -> StatusSummary {
    self.root.summary()
  }

  pub fn is_complete(&self) -> bool {
    self.root.is_complete()
  }

  pub fn start_time(&self) -> Option<DateTime<Utc>> {
    self.times().0
  }

  pub fn end_time(&self) -> Option<DateTime<Utc>> {
    self.times().1
  }

  pub fn dimension_colours(&self) -> DimensionColours {
    self
      .colours
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  pub fn report(&self) -> TreeReport {
    TreeReport {
      execution_id: self.execution_id.clone(),
      start_time: self.start_time(),
      end_time: self.end_time(),
      root: GroupReport::from_group(&self.root),
      dimension_colours: self.dimension_colours(),
    }
  }

  /// Execute every control and wait until none is in flight.
  ///
  /// Individual control failures are recorded on the runs and in the
  /// summaries; the returned error covers the tree itself: readiness
  /// failure, cancellation, or runs that outlived the drain timeout.
  #[instrument(
    name = "control_tree_execute",
    skip_all,
    fields(execution_id = %self.execution_id)
  )]
  pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    self.times().0 = Some(Utc::now());
    info!(
      execution_id = %self.execution_id,
      controls = self.runs.len(),
      max_parallel = self.context.config.max_parallel,
      "execution_started"
    );
    self.context.notify(ControlEvent::ExecutionStarted {
      execution_id: self.execution_id.clone(),
      total_controls: self.runs.len(),
    });

    let result = self.execute_inner(cancel).await;
    self.times().1 = Some(Utc::now());

    let summary = self.summary();
    match &result {
      Ok(()) => {
        info!(
          execution_id = %self.execution_id,
          ok = summary.ok,
          alarm = summary.alarm,
          info = summary.info,
          skip = summary.skip,
          error = summary.error,
          "execution_completed"
        );
      }
      Err(e) => {
        error!(execution_id = %self.execution_id, error = %e, "execution_failed");
      }
    }
    self.context.notify(ControlEvent::ExecutionCompleted {
      execution_id: self.execution_id.clone(),
      summary,
      error: result.as_ref().err().map(|e| e.to_string()),
    });
    result
  }

  async fn execute_inner(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    if let Some(search_path) = &self.search_path {
      match self.readiness.wait_for_search_path(search_path, cancel).await {
        Ok(()) => {}
        Err(e) if e.is_relation_not_found() => {
          warn!(error = %e, "readiness_check_unsupported");
        }
        Err(e) => {
          let error = ControlError::from(e);
          for run in &self.runs {
            run.abandon(error.clone());
          }
          return Err(error);
        }
      }
    }

    self.root.execute(cancel).await;
    let drained = self.drain(cancel).await;

    *self
      .colours
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) =
      DimensionColours::assign(&self.runs, &self.context.config.dimension_palette);

    drained?;
    if cancel.is_cancelled() {
      return Err(ControlError::Cancelled);
    }
    Ok(())
  }

  /// Wait for every launched run by taking the whole semaphore.
  ///
  /// Once cancelled, the wait is bounded by the drain timeout; runs still
  /// in flight after it are settled as cancelled.
  async fn drain(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
    let semaphore = &self.context.semaphore;
    let permits = self.context.config.max_parallel.max(1) as u32;
    let timeout = self.context.config.drain_timeout();

    let drained = tokio::select! {
      permit = semaphore.acquire_many(permits) => permit.is_ok(),
      _ = cancel.cancelled() => {
        matches!(
          tokio::time::timeout(timeout, semaphore.acquire_many(permits)).await,
          Ok(Ok(_))
        )
      }
    };
    if drained {
      return Ok(());
    }

    let remaining: Vec<_> = self.runs.iter().filter(|run| !run.is_complete()).collect();
    warn!(
      execution_id = %self.execution_id,
      remaining = remaining.len(),
      "drain_timeout"
    );
    for run in &remaining {
      run.abandon(ControlError::Cancelled);
    }
    Err(ControlError::DrainTimeout {
      remaining: remaining.len(),
    })
  }
}
