use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_config::{ExecutionConfig, ResourceProvider, Workspace};
use tessera_control::{ChannelNotifier, ControlEvent, ControlExecutionTree};
use tessera_dashboard::DashboardExecutionTree;
use tessera_query::{MemoryClient, MemoryFixture};
use tessera_run::RunStatus;

/// Tessera - runs control benchmarks and dashboards against a query backend
#[derive(Parser)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.tessera)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Workspace file with controls, benchmarks and dashboards
  #[arg(long, global = true, default_value = "workspace.json")]
  workspace: PathBuf,

  /// Backend fixture file: SQL text to scripted responses
  #[arg(long, global = true)]
  backend: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run controls and benchmarks
  Check {
    /// Controls, benchmarks, the mod name, or `all`
    #[arg(required = true)]
    names: Vec<String>,

    /// Maximum number of controls running at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Only run controls matching this where clause
    #[arg(long = "where")]
    where_clause: Option<String>,

    /// Only run controls with this tag value (key=value, repeatable)
    #[arg(long)]
    tag: Vec<String>,
  },

  /// Execute a dashboard
  Dashboard {
    name: String,

    /// Input value (name=value, repeatable)
    #[arg(long)]
    input: Vec<String>,

    /// Dashboard param value (name=value, repeatable)
    #[arg(long)]
    param: Vec<String>,
  },
}

/// What both commands run against.
struct Environment {
  config: ExecutionConfig,
  provider: Arc<dyn ResourceProvider>,
  client: Arc<MemoryClient>,
}

fn main() -> Result<ExitCode> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(data_dir) => data_dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".tessera"),
  };

  let Some(command) = cli.command else {
    println!("tessera - use --help to see available commands");
    return Ok(ExitCode::SUCCESS);
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let env = load_environment(&data_dir, &cli.workspace, cli.backend.as_deref()).await?;
    match command {
      Commands::Check {
        names,
        max_parallel,
        where_clause,
        tag,
      } => run_check(env, names, max_parallel, where_clause, tag).await,
      Commands::Dashboard { name, input, param } => run_dashboard(env, name, input, param).await,
    }
  })
}

async fn load_environment(
  data_dir: &Path,
  workspace: &Path,
  backend: Option<&Path>,
) -> Result<Environment> {
  let config_path = data_dir.join("config.json");
  let config = ExecutionConfig::load(&config_path)
    .with_context(|| format!("failed to load config: {}", config_path.display()))?;

  let workspace = Workspace::load(workspace)
    .with_context(|| format!("failed to load workspace: {}", workspace.display()))?;
  eprintln!("Loaded workspace: {}", workspace.mod_name());

  let client = match backend {
    Some(path) => {
      let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read backend file: {}", path.display()))?;
      let fixture: MemoryFixture = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse backend file: {}", path.display()))?;
      eprintln!("Loaded backend with {} scripted queries", fixture.responses.len());
      MemoryClient::from_fixture(fixture)
    }
    None => {
      eprintln!("No backend file given; every query will fail");
      MemoryClient::new()
    }
  };

  Ok(Environment {
    config,
    provider: Arc::new(workspace),
    client: Arc::new(client),
  })
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: &CancellationToken) {
  let cancel = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("interrupted");
      cancel.cancel();
    }
  });
}

/// Split `name=value`. The value is JSON if it parses as JSON, a string
/// otherwise.
/// How long a printer may keep draining events once the tree has returned.
const PRINTER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for an event printer to drain its channel.
///
/// Runs abandoned after a drain timeout keep their sender alive, so the wait
/// is bounded and the printer is aborted when it expires.
async fn join_printer(printer: JoinHandle<()>, flush: Duration) -> Result<()> {
  let abort = printer.abort_handle();
  match tokio::time::timeout(flush, printer).await {
    Ok(joined) => Ok(joined?),
    Err(_) => {
      warn!(timeout_ms = flush.as_millis() as u64, "printer_flush_timeout");
      abort.abort();
      Ok(())
    }
  }
}

fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
  let Some((name, value)) = assignment.split_once('=') else {
    bail!("expected name=value, got '{assignment}'");
  };
  let value =
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((name.trim().to_string(), value))
}

async fn run_check(
  env: Environment,
  names: Vec<String>,
  max_parallel: Option<usize>,
  where_clause: Option<String>,
  tags: Vec<String>,
) -> Result<ExitCode> {
  let mut config = env.config;
  if let Some(max_parallel) = max_parallel {
    config.max_parallel = max_parallel;
  }
  if where_clause.is_some() {
    config.where_clause = where_clause;
  }
  for tag in tags {
    let Some((key, value)) = tag.split_once('=') else {
      bail!("expected key=value for --tag, got '{tag}'");
    };
    config
      .tags
      .entry(key.to_string())
      .or_default()
      .push(value.to_string());
  }

  let cancel = CancellationToken::new();
  cancel_on_interrupt(&cancel);

  let (sender, mut receiver) = mpsc::unbounded_channel();
  let tree = ControlExecutionTree::builder(env.client.clone(), env.provider)
    .config(config)
    .readiness(env.client)
    .notifier(Arc::new(ChannelNotifier::new(sender)))
    .build(&names, &cancel)
    .await
    .context("failed to build control tree")?;
  eprintln!("Running {} controls", tree.runs().len());

  let progress = tokio::spawn(async move {
    while let Some(event) = receiver.recv().await {
      match event {
        ControlEvent::ControlCompleted {
          control, summary, ..
        } => eprintln!(
          "{control}: ok={} alarm={} info={} skip={} error={}",
          summary.ok, summary.alarm, summary.info, summary.skip, summary.error
        ),
        ControlEvent::ControlFailed { control, error, .. } => {
          eprintln!("{control}: failed: {error}");
        }
        _ => {}
      }
    }
  });

  let result = tree.execute(&cancel).await;
  let report = tree.report();
  drop(tree);
  join_printer(progress, PRINTER_FLUSH_TIMEOUT).await?;

  println!("{}", serde_json::to_string_pretty(&report)?);
  result.context("control execution failed")?;

  let summary = report.root.summary;
  eprintln!(
    "Completed: {} passed, {} failed, {} total",
    summary.passed(),
    summary.failed(),
    summary.total()
  );
  Ok(if summary.failed() > 0 {
    ExitCode::FAILURE
  } else {
    ExitCode::SUCCESS
  })
}

async fn run_dashboard(
  env: Environment,
  name: String,
  inputs: Vec<String>,
  params: Vec<String>,
) -> Result<ExitCode> {
  let (sender, mut receiver) = mpsc::unbounded_channel();
  let mut builder = DashboardExecutionTree::builder(env.client.clone(), env.provider)
    .config(env.config)
    .readiness(env.client)
    .notifier(Arc::new(tessera_dashboard::ChannelNotifier::new(sender)));
  for param in &params {
    let (name, value) = parse_assignment(param)?;
    builder = builder.param(name, value);
  }
  let tree = builder
    .build(&name)
    .with_context(|| format!("failed to build dashboard: {name}"))?;

  let inputs = inputs
    .iter()
    .map(|input| parse_assignment(input))
    .collect::<Result<BTreeMap<_, _>>>()?;
  let missing: Vec<String> = tree
    .input_runtime_dependencies()
    .into_iter()
    .filter(|input| !inputs.contains_key(input))
    .collect();
  if !missing.is_empty() {
    bail!("dashboard '{name}' needs values for inputs: {}", missing.join(", "));
  }
  tree.set_input_values(inputs).await?;

  let printer = tokio::spawn(async move {
    while let Some(event) = receiver.recv().await {
      match serde_json::to_string(&event) {
        Ok(line) => eprintln!("{line}"),
        Err(e) => eprintln!("failed to serialize event: {e}"),
      }
    }
  });

  let cancel = CancellationToken::new();
  cancel_on_interrupt(&cancel);

  let result = tree.execute(&cancel).await;
  let nodes = tree.snapshot();
  let status = tree.status();
  drop(tree);
  join_printer(printer, PRINTER_FLUSH_TIMEOUT).await?;

  println!("{}", serde_json::to_string_pretty(&nodes)?);
  result.context("dashboard execution failed")?;

  Ok(if status == RunStatus::Error {
    ExitCode::FAILURE
  } else {
    ExitCode::SUCCESS
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_join_printer_returns_once_channel_closes() {
    let (sender, mut receiver) = mpsc::unbounded_channel::<u32>();
    let printer = tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    sender.send(1).unwrap();
    drop(sender);

    join_printer(printer, Duration::from_secs(5)).await.unwrap();
  }

  #[tokio::test]
  async fn test_join_printer_gives_up_on_a_held_sender() {
    let (sender, mut receiver) = mpsc::unbounded_channel::<u32>();
    let printer = tokio::spawn(async move { while receiver.recv().await.is_some() {} });

    let joined = tokio::time::timeout(
      Duration::from_secs(5),
      join_printer(printer, Duration::from_millis(20)),
    )
    .await;

    assert!(matches!(joined, Ok(Ok(()))));
    drop(sender);
  }

  #[test]
  fn test_parse_assignment() {
    assert_eq!(
      parse_assignment("limit=10").unwrap(),
      ("limit".to_string(), serde_json::json!(10))
    );
    assert_eq!(
      parse_assignment("region=us-east-1").unwrap(),
      ("region".to_string(), serde_json::json!("us-east-1"))
    );
  }
}
