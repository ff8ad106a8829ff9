use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tessera_config::{ExecutionConfig, ResourceProvider, Workspace};
use tessera_control::{
  ChannelNotifier, ControlError, ControlEvent, ControlExecutionTree, ControlStatus, StatusSummary,
};
use tessera_query::{
  ColumnDef, DataType, MemoryClient, QueryClient, QueryError, QueryResult, ScriptedResponse,
  Session, SyncResult,
};
use tessera_run::RunStatus;
use tokio_util::sync::CancellationToken;

fn control_columns() -> Vec<ColumnDef> {
  vec![
    ColumnDef::new("resource", DataType::Text),
    ColumnDef::new("status", DataType::Text),
    ColumnDef::new("reason", DataType::Text),
    ColumnDef::new("region", DataType::Text),
  ]
}

fn rows(statuses: &[&str]) -> ScriptedResponse {
  let rows = statuses
    .iter()
    .enumerate()
    .map(|(i, status)| {
      vec![
        json!(format!("r{}", i)),
        json!(status),
        json!(format!("{} reason", status)),
        json!("us-east-1"),
      ]
    })
    .collect();
  ScriptedResponse::rows(control_columns(), rows)
}

fn workspace(value: Value) -> Arc<dyn ResourceProvider> {
  Arc::new(Workspace::new(serde_json::from_value(value).unwrap()).unwrap())
}

/// A mod with one benchmark per entry, each control running `select <name>`.
fn benchmark_workspace(controls: &[&str]) -> Arc<dyn ResourceProvider> {
  let control_defs: Vec<Value> = controls
    .iter()
    .map(|name| json!({ "name": name, "sql": format!("select {}", name), "severity": "high" }))
    .collect();
  workspace(json!({
    "mod": { "name": "compliance" },
    "controls": control_defs,
    "benchmarks": [{ "name": "bench", "children": controls }]
  }))
}

fn fast_config() -> ExecutionConfig {
  ExecutionConfig {
    session_retry_backoff_ms: 1,
    drain_timeout_ms: 1_000,
    ..ExecutionConfig::default()
  }
}

async fn build(
  client: &MemoryClient,
  provider: Arc<dyn ResourceProvider>,
  config: ExecutionConfig,
  names: &[&str],
) -> ControlExecutionTree {
  let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
  ControlExecutionTree::builder(Arc::new(client.clone()), provider)
    .config(config)
    .readiness(Arc::new(client.clone()))
    .build(&names, &CancellationToken::new())
    .await
    .unwrap()
}

#[tokio::test]
async fn test_benchmark_with_two_ok_controls() {
  let client = MemoryClient::new()
    .with_response("select c1", rows(&["ok"]))
    .with_response("select c2", rows(&["ok"]));
  let tree = build(
    &client,
    benchmark_workspace(&["c1", "c2"]),
    fast_config(),
    &["bench"],
  )
  .await;

  tree.execute(&CancellationToken::new()).await.unwrap();

  let summary = tree.summary();
  assert_eq!(
    summary,
    StatusSummary {
      ok: 2,
      ..Default::default()
    }
  );
  assert_eq!(summary.failed(), 0);
  assert!(tree.is_complete());
  assert!(tree.start_time().is_some() && tree.end_time().is_some());
  assert_eq!(tree.root().severity_summary()["high"].ok, 2);
  assert!(tree.root().dimension_keys().contains("region"));
  for run in tree.runs() {
    assert_eq!(run.status(), RunStatus::Complete);
  }
  // every session handed back, none flagged as cancelled
  let closed = client.closed_sessions();
  assert_eq!(closed.len(), 2);
  assert!(closed.iter().all(|(_, cancelled)| !cancelled));
}

#[tokio::test]
async fn test_row_error_keeps_processed_rows_and_counts_one_error() {
  let client = MemoryClient::new().with_response(
    "select c1",
    rows(&["ok", "alarm", "ok", "ok", "ok"]).failing_at(2, QueryError::query("division by zero")),
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;

  tree.execute(&CancellationToken::new()).await.unwrap();

  let run = tree.run("c1").unwrap();
  assert_eq!(run.status(), RunStatus::Error);
  assert!(matches!(run.error(), Some(ControlError::Row { .. })));
  let rows = run.rows();
  assert_eq!(rows.len(), 2);
  assert_eq!(rows[0].status, ControlStatus::Alarm);
  assert_eq!(
    tree.summary(),
    StatusSummary {
      ok: 1,
      alarm: 1,
      error: 1,
      ..Default::default()
    }
  );
}

#[tokio::test]
async fn test_rows_are_grouped_by_status_priority() {
  let client = MemoryClient::new().with_response(
    "select c1",
    rows(&["ok", "skip", "alarm", "ok", "error", "info", "alarm"]),
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  let order: Vec<(ControlStatus, String)> = tree
    .run("c1")
    .unwrap()
    .rows()
    .into_iter()
    .map(|row| (row.status, row.resource))
    .collect();
  assert_eq!(
    order,
    vec![
      (ControlStatus::Error, "r4".to_string()),
      (ControlStatus::Alarm, "r2".to_string()),
      (ControlStatus::Alarm, "r6".to_string()),
      (ControlStatus::Info, "r5".to_string()),
      (ControlStatus::Ok, "r0".to_string()),
      (ControlStatus::Ok, "r3".to_string()),
      (ControlStatus::Skip, "r1".to_string()),
    ]
  );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded_across_the_tree() {
  let names: Vec<String> = (0..8).map(|i| format!("c{}", i)).collect();
  let client = MemoryClient::new();
  for name in &names {
    client.set_response(&format!("select {}", name), rows(&["ok"]).delayed(30));
  }
  // split the controls over two nested benchmarks so the cap must hold across branches
  let provider = workspace(json!({
    "mod": { "name": "m" },
    "controls": names.iter().map(|n| json!({ "name": n, "sql": format!("select {}", n) })).collect::<Vec<_>>(),
    "benchmarks": [
      { "name": "top", "children": ["left", "right"] },
      { "name": "left", "children": names[..4] },
      { "name": "right", "children": names[4..] }
    ]
  }));
  let config = ExecutionConfig {
    max_parallel: 3,
    ..fast_config()
  };
  let tree = Arc::new(build(&client, provider, config, &["top"]).await);

  let observed_running = Arc::new(AtomicUsize::new(0));
  let monitor = {
    let tree = Arc::clone(&tree);
    let observed = Arc::clone(&observed_running);
    tokio::spawn(async move {
      while !tree.is_complete() {
        let running = tree
          .runs()
          .iter()
          .filter(|run| run.status() == RunStatus::Running)
          .count();
        observed.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
  };

  tree.execute(&CancellationToken::new()).await.unwrap();
  monitor.await.unwrap();

  assert_eq!(tree.summary().ok, 8);
  assert!(client.max_in_flight() <= 3);
  assert!(observed_running.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_connectivity_faults_retry_up_to_the_ceiling() {
  let client = MemoryClient::new().with_response(
    "select c1",
    ScriptedResponse::error(QueryError::connectivity("plugin exited")),
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  let run = tree.run("c1").unwrap();
  assert_eq!(run.status(), RunStatus::Error);
  assert_eq!(run.attempts(), 3);
  assert_eq!(client.call_count("select c1"), 3);
  assert_eq!(tree.summary().error, 1);
}

#[tokio::test]
async fn test_connectivity_fault_then_success() {
  let client = MemoryClient::new().with_response(
    "select c1",
    ScriptedResponse::Sequence {
      responses: vec![
        ScriptedResponse::error(QueryError::connectivity("plugin exited")),
        rows(&["ok", "alarm"]),
      ],
    },
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  let run = tree.run("c1").unwrap();
  assert_eq!(run.status(), RunStatus::Complete);
  assert_eq!(run.attempts(), 2);
  assert_eq!(
    run.summary(),
    StatusSummary {
      ok: 1,
      alarm: 1,
      ..Default::default()
    }
  );
}

#[tokio::test]
async fn test_query_errors_are_not_retried() {
  let client = MemoryClient::new().with_response(
    "select c1",
    ScriptedResponse::error(QueryError::query("syntax error")),
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert_eq!(client.call_count("select c1"), 1);
  assert_eq!(tree.run("c1").unwrap().status(), RunStatus::Error);
}

#[tokio::test]
async fn test_session_acquisition_is_retried() {
  let client = MemoryClient::new().with_response("select c1", rows(&["ok"]));
  client.fail_acquire([
    QueryError::session_acquisition("pool exhausted"),
    QueryError::session_acquisition("pool exhausted"),
  ]);
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert_eq!(client.acquire_attempts(), 3);
  assert_eq!(tree.run("c1").unwrap().status(), RunStatus::Complete);
}

#[tokio::test]
async fn test_session_acquisition_gives_up() {
  let client = MemoryClient::new().with_response("select c1", rows(&["ok"]));
  client.fail_acquire((0..10).map(|_| QueryError::session_acquisition("pool exhausted")));
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert_eq!(client.acquire_attempts(), 4);
  assert!(matches!(
    tree.run("c1").unwrap().error(),
    Some(ControlError::SessionAcquisition { attempts: 4, .. })
  ));
  assert_eq!(client.call_count("select c1"), 0);
}

#[tokio::test]
async fn test_missing_columns_fail_the_run() {
  let client = MemoryClient::new().with_response(
    "select c1",
    ScriptedResponse::rows(
      vec![ColumnDef::new("resource", DataType::Text)],
      vec![vec![json!("r")]],
    ),
  );
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  let run = tree.run("c1").unwrap();
  assert!(matches!(run.error(), Some(ControlError::MissingColumns { .. })));
  assert!(run.rows().is_empty());
}

#[tokio::test]
async fn test_cancelling_a_hung_control() {
  let client = MemoryClient::new().with_response("select c1", ScriptedResponse::Hang);
  let tree = build(&client, benchmark_workspace(&["c1"]), fast_config(), &["c1"]).await;

  let cancel = CancellationToken::new();
  let canceller = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(30)).await;
    canceller.cancel();
  });

  let result = tokio::time::timeout(Duration::from_secs(2), tree.execute(&cancel))
    .await
    .expect("tree drain hung");
  assert_eq!(result, Err(ControlError::Cancelled));

  let run = tree.run("c1").unwrap();
  assert_eq!(run.status(), RunStatus::Error);
  assert!(run.error().unwrap().is_cancelled());
  assert_eq!(client.closed_sessions()[0].1, true);
  assert!(tree.is_complete());
}

#[tokio::test]
async fn test_cancelled_before_launch_settles_every_run() {
  let client = MemoryClient::new()
    .with_response("select c1", rows(&["ok"]))
    .with_response("select c2", rows(&["ok"]));
  let tree = build(
    &client,
    benchmark_workspace(&["c1", "c2"]),
    fast_config(),
    &["bench"],
  )
  .await;

  let cancel = CancellationToken::new();
  cancel.cancel();
  assert!(tree.execute(&cancel).await.is_err());
  assert!(tree.is_complete());
  assert_eq!(tree.summary().error, 2);
}

#[tokio::test]
async fn test_control_timeout() {
  let client = MemoryClient::new()
    .with_response("select c1", ScriptedResponse::Hang)
    .with_response("select c2", rows(&["ok"]));
  let config = ExecutionConfig {
    control_timeout_ms: Some(30),
    ..fast_config()
  };
  let tree = build(&client, benchmark_workspace(&["c1", "c2"]), config, &["bench"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert!(matches!(
    tree.run("c1").unwrap().error(),
    Some(ControlError::Timeout { .. })
  ));
  assert_eq!(tree.run("c2").unwrap().status(), RunStatus::Complete);
}

#[tokio::test]
async fn test_nested_summaries_are_additive() {
  let provider = workspace(json!({
    "mod": { "name": "m" },
    "controls": [
      { "name": "a", "sql": "select a", "severity": "low" },
      { "name": "b", "sql": "select b", "severity": "high" },
      { "name": "c", "sql": "select c" },
      { "name": "d", "sql": "select d" }
    ],
    "benchmarks": [
      { "name": "top", "children": ["inner", "c"] },
      { "name": "inner", "children": ["a", "b", "deeper"] },
      { "name": "deeper", "children": ["d"] }
    ]
  }));
  let client = MemoryClient::new()
    .with_response("select a", rows(&["ok", "alarm", "info"]))
    .with_response("select b", rows(&["skip", "error"]))
    .with_response("select c", rows(&["ok", "ok"]))
    .with_response(
      "select d",
      ScriptedResponse::error(QueryError::query("relation missing")),
    );
  let tree = build(&client, provider, fast_config(), &["all"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  fn check(group: &tessera_control::ResultGroup) -> StatusSummary {
    let mut expected = StatusSummary::default();
    for run in group.runs() {
      expected.merge(&run.summary());
    }
    for child in group.groups() {
      expected.merge(&check(child));
    }
    assert_eq!(group.summary(), expected, "group {}", group.name());
    expected
  }
  let total = check(tree.root());
  assert_eq!(total.total(), 3 + 2 + 2 + 1);
  assert_eq!(total.error, 2);

  let severity = tree.root().severity_summary();
  assert_eq!(severity["low"].total(), 3);
  assert_eq!(severity["high"].total(), 2);
}

#[tokio::test]
async fn test_tag_filter_limits_the_tree() {
  let client = MemoryClient::new()
    .with_response("select c1", rows(&["ok"]))
    .with_response("select c2", rows(&["ok"]))
    .with_response(
      "select resource_name from tessera_control where (tags ->> 'service' in ('s3'))",
      ScriptedResponse::rows(
        vec![ColumnDef::new("resource_name", DataType::Text)],
        vec![vec![json!("c1")]],
      ),
    );
  let mut config = fast_config();
  config
    .tags
    .insert("service".to_string(), vec!["s3".to_string()]);
  let tree = build(&client, benchmark_workspace(&["c1", "c2"]), config, &["bench"]).await;

  assert_eq!(tree.runs().len(), 1);
  tree.execute(&CancellationToken::new()).await.unwrap();
  assert_eq!(client.call_count("select c2"), 0);
}

#[tokio::test]
async fn test_readiness_relation_not_found_is_ignored() {
  let client = MemoryClient::new().with_response("select c1", rows(&["ok"]));
  client.set_readiness_error(QueryError::relation_not_found("tessera_connection_state"));
  let config = ExecutionConfig {
    search_path: Some(vec!["aws".to_string()]),
    ..fast_config()
  };
  let tree = build(&client, benchmark_workspace(&["c1"]), config, &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert_eq!(client.readiness_checks(), vec![vec!["aws".to_string()]]);
  assert_eq!(tree.summary().ok, 1);
}

#[tokio::test]
async fn test_readiness_failure_fails_the_tree() {
  let client = MemoryClient::new().with_response("select c1", rows(&["ok"]));
  client.set_readiness_error(QueryError::connectivity("plugin failed to start"));
  let config = ExecutionConfig {
    search_path: Some(vec!["aws".to_string()]),
    ..fast_config()
  };
  let tree = build(&client, benchmark_workspace(&["c1"]), config, &["c1"]).await;

  assert!(tree.execute(&CancellationToken::new()).await.is_err());
  assert!(tree.is_complete());
  assert_eq!(client.call_count("select c1"), 0);
}

#[tokio::test]
async fn test_control_search_path_is_set_in_its_session() {
  let provider = workspace(json!({
    "mod": { "name": "m" },
    "controls": [{ "name": "c1", "sql": "select c1", "search_path_prefix": ["custom"] }]
  }));
  let client = MemoryClient::new().with_response("select c1", rows(&["ok"]));
  let config = ExecutionConfig {
    search_path: Some(vec!["aws".to_string()]),
    ..fast_config()
  };
  let tree = build(&client, provider, config, &["c1"]).await;
  tree.execute(&CancellationToken::new()).await.unwrap();

  let executions = client.executions();
  assert_eq!(executions[0].sql, r#"set search_path to "custom", "aws""#);
  assert_eq!(executions[1].sql, "select c1");
  assert_eq!(executions[0].session_id, executions[1].session_id);
}

#[tokio::test]
async fn test_events_bracket_the_execution() {
  let client = MemoryClient::new()
    .with_response("select c1", rows(&["ok"]))
    .with_response("select c2", ScriptedResponse::error(QueryError::query("bad")));
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let names = vec!["bench".to_string()];
  let tree = ControlExecutionTree::builder(Arc::new(client), benchmark_workspace(&["c1", "c2"]))
    .config(fast_config())
    .notifier(Arc::new(ChannelNotifier::new(tx)))
    .build(&names, &CancellationToken::new())
    .await
    .unwrap();
  tree.execute(&CancellationToken::new()).await.unwrap();
  drop(tree);

  let mut events = Vec::new();
  while let Some(event) = rx.recv().await {
    events.push(event);
  }
  assert!(matches!(
    events.first(),
    Some(ControlEvent::ExecutionStarted {
      total_controls: 2,
      ..
    })
  ));
  assert!(matches!(
    events.last(),
    Some(ControlEvent::ExecutionCompleted { error: None, .. })
  ));
  let started = events
    .iter()
    .filter(|e| matches!(e, ControlEvent::ControlStarted { .. }))
    .count();
  let completed = events
    .iter()
    .filter(|e| matches!(e, ControlEvent::ControlCompleted { .. }))
    .count();
  let failed = events
    .iter()
    .filter(|e| matches!(e, ControlEvent::ControlFailed { .. }))
    .count();
  assert_eq!((started, completed, failed), (2, 1, 1));
}

/// Backend whose session acquisition never returns, even when cancelled.
struct StuckClient;

#[async_trait]
impl QueryClient for StuckClient {
  async fn acquire_session(&self, _cancel: &CancellationToken) -> Result<Session, QueryError> {
    futures::future::pending().await
  }

  async fn execute_in_session(
    &self,
    _session: &Session,
    _sql: &str,
    _args: &[Value],
    _cancel: &CancellationToken,
  ) -> Result<QueryResult, QueryError> {
    Err(QueryError::query("unreachable"))
  }

  async fn execute_sync(
    &self,
    _sql: &str,
    _args: &[Value],
    _cancel: &CancellationToken,
  ) -> Result<SyncResult, QueryError> {
    Err(QueryError::query("unreachable"))
  }

  async fn close_session(&self, _session: Session, _cancelled: bool) {}
}

#[tokio::test]
async fn test_drain_timeout_settles_stuck_runs() {
  let config = ExecutionConfig {
    drain_timeout_ms: 50,
    ..fast_config()
  };
  let names = vec!["bench".to_string()];
  let tree = ControlExecutionTree::builder(Arc::new(StuckClient), benchmark_workspace(&["c1", "c2"]))
    .config(config)
    .build(&names, &CancellationToken::new())
    .await
    .unwrap();

  let cancel = CancellationToken::new();
  let canceller = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();
  });

  let result = tokio::time::timeout(Duration::from_secs(2), tree.execute(&cancel))
    .await
    .expect("drain ignored its timeout");
  assert_eq!(result, Err(ControlError::DrainTimeout { remaining: 2 }));
  assert!(tree.is_complete());
  for run in tree.runs() {
    assert!(run.error().unwrap().is_cancelled());
  }
  assert_eq!(tree.summary().error, 2);
}

/// Backend that panics while submitting one statement.
struct PanickingClient(MemoryClient);

#[async_trait]
impl QueryClient for PanickingClient {
  async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Session, QueryError> {
    self.0.acquire_session(cancel).await
  }

  async fn execute_in_session(
    &self,
    session: &Session,
    sql: &str,
    args: &[Value],
    cancel: &CancellationToken,
  ) -> Result<QueryResult, QueryError> {
    if sql == "select c1" {
      panic!("driver bug");
    }
    self.0.execute_in_session(session, sql, args, cancel).await
  }

  async fn execute_sync(
    &self,
    sql: &str,
    args: &[Value],
    cancel: &CancellationToken,
  ) -> Result<SyncResult, QueryError> {
    self.0.execute_sync(sql, args, cancel).await
  }

  async fn close_session(&self, session: Session, cancelled: bool) {
    self.0.close_session(session, cancelled).await
  }
}

#[tokio::test]
async fn test_panicking_run_becomes_an_error() {
  let client = PanickingClient(MemoryClient::new().with_response("select c2", rows(&["ok"])));
  let names = vec!["bench".to_string()];
  let tree = ControlExecutionTree::builder(Arc::new(client), benchmark_workspace(&["c1", "c2"]))
    .config(ExecutionConfig {
      max_parallel: 1,
      ..fast_config()
    })
    .build(&names, &CancellationToken::new())
    .await
    .unwrap();
  tree.execute(&CancellationToken::new()).await.unwrap();

  assert_eq!(
    tree.run("c1").unwrap().error(),
    Some(ControlError::Panicked {
      message: "driver bug".to_string()
    })
  );
  assert_eq!(tree.run("c2").unwrap().status(), RunStatus::Complete);
}
