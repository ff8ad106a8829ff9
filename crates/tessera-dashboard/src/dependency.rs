//! Runtime dependencies between dashboard nodes.
//!
//! A node that supplies a value (the dashboard for inputs and params, a scope
//! for its `with` results) owns a [`DependencyPublisher`]. Dependents
//! subscribe before execution starts and wait on a one-shot slot. Publishing
//! hands the value to every current subscriber and clears the list, so each
//! subscription sees exactly one value; a node that is re-executed
//! subscribes again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tessera_config::RuntimeRef;
use tessera_query::SyncResult;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DependencyError;

/// A value as published, before any path projection.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyValue {
  /// An input or param value.
  Scalar(Value),
  /// A `with` result.
  Table(SyncResult),
}

pub type Published = Result<DependencyValue, DependencyError>;

struct Subscription {
  subscriber: String,
  sender: oneshot::Sender<Published>,
}

/// Hands published values to subscribers, once per subscription.
#[derive(Default)]
pub struct DependencyPublisher {
  subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl DependencyPublisher {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
    self
      .subscriptions
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Register `subscriber` for the next value published under `name`.
  pub fn subscribe(&self, name: &str, subscriber: &str) -> oneshot::Receiver<Published> {
    let (sender, receiver) = oneshot::channel();
    self
      .lock()
      .entry(name.to_string())
      .or_default()
      .push(Subscription {
        subscriber: subscriber.to_string(),
        sender,
      });
    receiver
  }

  /// Deliver `value` to every current subscriber of `name` and clear them.
  ///
  /// Returns the subscribers that received it. A subscriber registering
  /// after this call waits for the next publish.
  pub fn publish(&self, name: &str, value: Published) -> Vec<String> {
    let subscriptions = self.lock().remove(name).unwrap_or_default();
    let mut delivered = Vec::with_capacity(subscriptions.len());
    for subscription in subscriptions {
      // A dropped receiver belongs to a node that stopped waiting
      if subscription.sender.send(value.clone()).is_ok() {
        delivered.push(subscription.subscriber);
      }
    }
    debug!(dependency = %name, subscribers = delivered.len(), "dependency_published");
    delivered
  }

  /// Number of subscriptions waiting on `name`.
  pub fn pending(&self, name: &str) -> usize {
    self.lock().get(name).map_or(0, Vec::len)
  }
}

/// Which rows a path selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSelector {
  All,
  Index(usize),
}

/// A projection over a `with` result: `rows`, `rows[*]`, `rows[N]`, each
/// optionally followed by `.column`; a bare `column` selects every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath {
  rows: RowSelector,
  column: Option<String>,
}

impl PropertyPath {
  pub fn parse(path: Option<&str>) -> Result<Self, String> {
    let path = path.map(str::trim).unwrap_or_default();
    let all = Self {
      rows: RowSelector::All,
      column: None,
    };
    if path.is_empty() {
      return Ok(all);
    }

    let Some(rest) = path.strip_prefix("rows") else {
      if path.contains(['.', '[', ']']) {
        return Err(format!("unsupported path '{path}'"));
      }
      return Ok(Self {
        column: Some(path.to_string()),
        ..all
      });
    };

    let (rows, rest) = match rest.strip_prefix('[') {
      Some(indexed) => {
        let (index, rest) = indexed
          .split_once(']')
          .ok_or_else(|| format!("unterminated index in '{path}'"))?;
        let rows = match index.trim() {
          "*" => RowSelector::All,
          n => RowSelector::Index(
            n.parse()
              .map_err(|_| format!("invalid row index '{n}' in '{path}'"))?,
          ),
        };
        (rows, rest)
      }
      None => (RowSelector::All, rest),
    };

    let column = match rest {
      "" => None,
      rest => match rest.strip_prefix('.') {
        Some(column) if !column.is_empty() && !column.contains(['.', '[']) => {
          Some(column.to_string())
        }
        _ => return Err(format!("unsupported path '{path}'")),
      },
    };
    Ok(Self { rows, column })
  }

  /// Project `table` to a single column: an array of its values, or the
  /// value in one row.
  pub fn project(&self, table: &SyncResult) -> Result<Value, String> {
    let index = match &self.column {
      Some(column) => table
        .column_index(column)
        .ok_or_else(|| format!("no column '{column}'"))?,
      None if table.columns.len() == 1 => 0,
      None => {
        return Err(format!(
          "result has {} columns; name one in the path",
          table.columns.len()
        ));
      }
    };

    let cell = |row: &Vec<Value>| row.get(index).cloned().unwrap_or(Value::Null);
    match self.rows {
      RowSelector::All => Ok(Value::Array(table.rows.iter().map(cell).collect())),
      RowSelector::Index(n) => table
        .rows
        .get(n)
        .map(cell)
        .ok_or_else(|| format!("row {n} out of range ({} rows)", table.rows.len())),
    }
  }
}

/// Serialize JSON-typed columns back to strings so a published result can be
/// bound as a query argument.
pub fn stringify_json_columns(mut table: SyncResult) -> SyncResult {
  let json_columns: Vec<usize> = table
    .columns
    .iter()
    .enumerate()
    .filter(|(_, column)| column.data_type.is_json())
    .map(|(index, _)| index)
    .collect();
  if json_columns.is_empty() {
    return table;
  }
  for row in &mut table.rows {
    for &index in &json_columns {
      if let Some(value) = row.get_mut(index)
        && !matches!(value, Value::Null | Value::String(_))
      {
        *value = Value::String(value.to_string());
      }
    }
  }
  table
}

#[derive(Default)]
struct Slot {
  receiver: Option<oneshot::Receiver<Published>>,
  value: Option<Value>,
}

/// One runtime argument of a node: the reference, where it is published, and
/// the value once resolved.
pub struct RuntimeDependency {
  reference: RuntimeRef,
  publisher: Arc<DependencyPublisher>,
  slot: Mutex<Slot>,
}

impl RuntimeDependency {
  pub(crate) fn new(reference: RuntimeRef, publisher: Arc<DependencyPublisher>) -> Self {
    Self {
      reference,
      publisher,
      slot: Mutex::new(Slot::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Slot> {
    self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn reference(&self) -> &RuntimeRef {
    &self.reference
  }

  /// `input.region`, `param.account`, `with.buckets`.
  pub fn name(&self) -> String {
    self.reference.dependency_name()
  }

  /// The resolved value, if it has been.
  pub fn value(&self) -> Option<Value> {
    self.lock().value.clone()
  }

  /// Subscribe for the next published value, dropping any earlier one.
  pub(crate) fn subscribe(&self, subscriber: &str) {
    let receiver = self.publisher.subscribe(&self.name(), subscriber);
    let mut slot = self.lock();
    slot.receiver = Some(receiver);
    slot.value = None;
  }

  /// Wait for the value and apply the reference's path.
  pub(crate) async fn resolve(&self, cancel: &CancellationToken) -> Result<Value, DependencyError> {
    let receiver = {
      let mut slot = self.lock();
      if let Some(value) = &slot.value {
        return Ok(value.clone());
      }
      slot.receiver.take()
    };
    let name = self.name();
    let Some(receiver) = receiver else {
      return Err(DependencyError::Unpublished { name });
    };

    let published = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(DependencyError::Cancelled { name }),
      published = receiver => published.map_err(|_| DependencyError::Unpublished { name: name.clone() })?,
    };
    let value = self.project(published?)?;
    self.lock().value = Some(value.clone());
    Ok(value)
  }

  fn project(&self, published: DependencyValue) -> Result<Value, DependencyError> {
    let value = match published {
      DependencyValue::Scalar(value) => value,
      DependencyValue::Table(table) => PropertyPath::parse(self.reference.path.as_deref())
        .and_then(|path| path.project(&table))
        .map_err(|message| DependencyError::Projection {
          name: self.name(),
          path: self.reference.path.clone().unwrap_or_default(),
          message,
        })?,
    };
    Ok(match value {
      Value::Array(_) => value,
      value if self.reference.expects_array => Value::Array(vec![value]),
      value => value,
    })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use tessera_config::DependencyKind;
  use tessera_query::{ColumnDef, DataType};

  use super::*;

  fn table() -> SyncResult {
    SyncResult {
      columns: vec![
        ColumnDef::new("arn", DataType::Text),
        ColumnDef::new("tags", DataType::Jsonb),
      ],
      rows: vec![
        vec![json!("arn:1"), json!({"env": "prod"})],
        vec![json!("arn:2"), json!(null)],
      ],
    }
  }

  fn with_ref(path: Option<&str>, expects_array: bool) -> RuntimeRef {
    RuntimeRef {
      kind: DependencyKind::With,
      name: "buckets".to_string(),
      path: path.map(str::to_string),
      expects_array,
    }
  }

  #[test]
  fn test_parse_paths() {
    let all = PropertyPath::parse(Some("rows[*].arn")).unwrap();
    assert_eq!(all, PropertyPath::parse(Some("rows.arn")).unwrap());
    assert_eq!(all, PropertyPath::parse(Some("arn")).unwrap());
    assert_eq!(
      PropertyPath::parse(Some("rows[1].arn")).unwrap().rows,
      RowSelector::Index(1)
    );
    assert!(PropertyPath::parse(Some("rows[x]")).is_err());
    assert!(PropertyPath::parse(Some("rows[0")).is_err());
    assert!(PropertyPath::parse(Some("rows.a.b")).is_err());
  }

  #[test]
  fn test_project_columns() {
    let table = table();
    let path = PropertyPath::parse(Some("rows[*].arn")).unwrap();
    assert_eq!(path.project(&table).unwrap(), json!(["arn:1", "arn:2"]));

    let path = PropertyPath::parse(Some("rows[0].arn")).unwrap();
    assert_eq!(path.project(&table).unwrap(), json!("arn:1"));

    let path = PropertyPath::parse(Some("rows[5].arn")).unwrap();
    assert!(path.project(&table).is_err());

    // two columns and no column named
    assert!(PropertyPath::parse(None).unwrap().project(&table).is_err());
  }

  #[test]
  fn test_single_column_is_implicit() {
    let table = SyncResult {
      columns: vec![ColumnDef::new("id", DataType::Integer)],
      rows: vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
    };
    assert_eq!(
      PropertyPath::parse(None).unwrap().project(&table).unwrap(),
      json!([1, 2, 3])
    );
  }

  #[test]
  fn test_stringify_json_columns() {
    let table = stringify_json_columns(table());
    assert_eq!(table.rows[0][1], json!("{\"env\":\"prod\"}"));
    assert_eq!(table.rows[1][1], json!(null));
    assert_eq!(table.rows[0][0], json!("arn:1"));
  }

  #[test]
  fn test_publish_clears_subscribers() {
    let publisher = DependencyPublisher::new();
    let mut first = publisher.subscribe("input.region", "a");
    let _second = publisher.subscribe("input.region", "b");
    assert_eq!(publisher.pending("input.region"), 2);

    let delivered = publisher.publish("input.region", Ok(DependencyValue::Scalar(json!("eu"))));
    assert_eq!(delivered, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(publisher.pending("input.region"), 0);
    assert_eq!(
      first.try_recv().unwrap(),
      Ok(DependencyValue::Scalar(json!("eu")))
    );

    // nobody left to deliver to
    assert!(publisher.publish("input.region", Ok(DependencyValue::Scalar(json!("us")))).is_empty());
  }

  #[tokio::test]
  async fn test_resolve_projects_and_wraps() {
    let publisher = Arc::new(DependencyPublisher::new());
    let scalar = RuntimeDependency::new(with_ref(Some("rows[0].arn"), true), Arc::clone(&publisher));
    let column = RuntimeDependency::new(with_ref(Some("arn"), true), Arc::clone(&publisher));
    scalar.subscribe("leaf");
    column.subscribe("leaf");

    publisher.publish("with.buckets", Ok(DependencyValue::Table(table())));

    let cancel = CancellationToken::new();
    assert_eq!(scalar.resolve(&cancel).await.unwrap(), json!(["arn:1"]));
    assert_eq!(column.resolve(&cancel).await.unwrap(), json!(["arn:1", "arn:2"]));
    // cached
    assert_eq!(scalar.value(), Some(json!(["arn:1"])));
  }

  #[tokio::test]
  async fn test_resolve_surfaces_publisher_error_and_cancel() {
    let publisher = Arc::new(DependencyPublisher::new());
    let failed = RuntimeDependency::new(with_ref(None, false), Arc::clone(&publisher));
    failed.subscribe("leaf");
    publisher.publish(
      "with.buckets",
      Err(DependencyError::Failed {
        name: "with.buckets".to_string(),
        message: "boom".to_string(),
      }),
    );
    let cancel = CancellationToken::new();
    assert!(matches!(
      failed.resolve(&cancel).await,
      Err(DependencyError::Failed { .. })
    ));

    let waiting = RuntimeDependency::new(with_ref(None, false), Arc::clone(&publisher));
    waiting.subscribe("leaf");
    cancel.cancel();
    assert!(matches!(
      waiting.resolve(&cancel).await,
      Err(DependencyError::Cancelled { .. })
    ));
  }
}
