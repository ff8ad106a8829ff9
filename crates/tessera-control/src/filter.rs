//! Control filtering by tag and where clause.
//!
//! The filter is evaluated once, before the tree is built, against the
//! backend's control introspection view. The result is an allow-list of
//! control names.

use std::collections::{BTreeMap, HashSet};

use tessera_config::ExecutionConfig;
use tessera_query::QueryClient;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ControlError;

/// Introspection view listing every control of the workspace.
pub const CONTROL_VIEW: &str = "tessera_control";

fn quote_literal(value: &str) -> String {
  format!("'{}'", value.replace('\'', "''"))
}

/// Turn a tag filter into a where clause: one `in` test per tag, and-joined.
pub fn tag_clause(tags: &BTreeMap<String, Vec<String>>) -> Option<String> {
  let tests: Vec<String> = tags
    .iter()
    .filter(|(_, values)| !values.is_empty())
    .map(|(key, values)| {
      let values: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
      format!("(tags ->> {} in ({}))", quote_literal(key), values.join(", "))
    })
    .collect();
  (!tests.is_empty()).then(|| tests.join(" and "))
}

/// Combined filter clause from the configured where clause and tags.
pub fn filter_clause(config: &ExecutionConfig) -> Option<String> {
  let mut parts = Vec::new();
  if let Some(clause) = &config.where_clause
    && !clause.trim().is_empty()
  {
    parts.push(format!("({})", clause.trim()));
  }
  if let Some(tags) = tag_clause(&config.tags) {
    parts.push(tags);
  }
  (!parts.is_empty()).then(|| parts.join(" and "))
}

/// Names of the controls matching `clause`.
pub async fn control_allow_list(
  client: &dyn QueryClient,
  clause: &str,
  cancel: &CancellationToken,
) -> Result<HashSet<String>, ControlError> {
  let sql = format!("select resource_name from {} where {}", CONTROL_VIEW, clause);
  let result = client.execute_sync(&sql, &[], cancel).await?;
  let column = result.column_index("resource_name").unwrap_or(0);
  let names: HashSet<String> = result
    .rows
    .iter()
    .filter_map(|row| row.get(column))
    .filter_map(|value| value.as_str().map(str::to_string))
    .collect();
  info!(clause = %clause, matched = names.len(), "control_filter_evaluated");
  Ok(names)
}
