//! Resource lookup.
//!
//! The execution trees never parse resource files themselves: they ask a
//! [`ResourceProvider`] for named items and for the SQL and arguments of
//! query-bearing items. [`Workspace`] is the provider backed by a JSON
//! workspace file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arg::{ArgDef, ArgSource, ArgValue, DependencyKind, ResolvedQuery, RuntimeRef};
use crate::control::{BenchmarkDef, ControlDef, QueryDef};
use crate::dashboard::{DashboardDef, NodeDef};
use crate::error::ConfigError;

/// A resolved tree item.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceItem {
  Control(ControlDef),
  Benchmark(BenchmarkDef),
  Dashboard(DashboardDef),
  /// The mod itself, standing for its top-level items.
  Mod {
    name: String,
    title: Option<String>,
    children: Vec<ResourceItem>,
  },
}

impl ResourceItem {
  pub fn name(&self) -> &str {
    match self {
      Self::Control(def) => &def.name,
      Self::Benchmark(def) => &def.name,
      Self::Dashboard(def) => &def.name,
      Self::Mod { name, .. } => name,
    }
  }

  pub fn title(&self) -> &str {
    match self {
      Self::Control(def) => def.display_title(),
      Self::Benchmark(def) => def.display_title(),
      Self::Dashboard(def) => def.title.as_deref().unwrap_or(&def.name),
      Self::Mod { name, title, .. } => title.as_deref().unwrap_or(name),
    }
  }
}

/// Serves resource definitions to the execution trees.
pub trait ResourceProvider: Send + Sync {
  fn mod_name(&self) -> &str;

  fn mod_title(&self) -> Option<&str> {
    None
  }

  fn control(&self, name: &str) -> Option<&ControlDef>;

  fn benchmark(&self, name: &str) -> Option<&BenchmarkDef>;

  fn dashboard(&self, name: &str) -> Option<&DashboardDef>;

  fn query(&self, name: &str) -> Option<&QueryDef>;

  fn variable(&self, name: &str) -> Option<&serde_json::Value>;

  /// Benchmarks that are no other benchmark's child, then controls that
  /// belong to no benchmark.
  fn top_level(&self) -> Vec<ResourceItem>;

  /// Resolve a control, benchmark or dashboard name. The mod name and `all`
  /// both resolve to the mod's top-level items.
  fn resolve(&self, name: &str) -> Result<ResourceItem, ConfigError> {
    if name == "all" || name == self.mod_name() {
      return Ok(ResourceItem::Mod {
        name: self.mod_name().to_string(),
        title: self.mod_title().map(str::to_string),
        children: self.top_level(),
      });
    }
    if let Some(control) = self.control(name) {
      return Ok(ResourceItem::Control(control.clone()));
    }
    if let Some(benchmark) = self.benchmark(name) {
      return Ok(ResourceItem::Benchmark(benchmark.clone()));
    }
    if let Some(dashboard) = self.dashboard(name) {
      return Ok(ResourceItem::Dashboard(dashboard.clone()));
    }
    Err(ConfigError::NotFound {
      name: name.to_string(),
    })
  }

  /// Children of a benchmark, in declaration order.
  fn children(&self, benchmark: &BenchmarkDef) -> Result<Vec<ResourceItem>, ConfigError> {
    benchmark
      .children
      .iter()
      .map(|child| {
        if let Some(control) = self.control(child) {
          Ok(ResourceItem::Control(control.clone()))
        } else if let Some(nested) = self.benchmark(child) {
          Ok(ResourceItem::Benchmark(nested.clone()))
        } else {
          Err(ConfigError::DanglingReference {
            parent: benchmark.name.clone(),
            child: child.clone(),
          })
        }
      })
      .collect()
  }

  /// Resolve the SQL and arguments of a query-bearing resource.
  ///
  /// Inline `sql` binds its arguments in order. A `query` reference binds
  /// arguments to the query's parameters: a named argument first, then the
  /// next unnamed argument, then the parameter default.
  fn resolve_query(
    &self,
    resource: &str,
    sql: Option<&str>,
    query: Option<&str>,
    args: &[ArgDef],
  ) -> Result<ResolvedQuery, ConfigError> {
    let bind = |arg: &ArgDef| -> Result<ArgValue, ConfigError> {
      match &arg.source {
        ArgSource::Value { value } => Ok(ArgValue::Static(value.clone())),
        ArgSource::Var { var } => self
          .variable(var)
          .map(|value| ArgValue::Static(value.clone()))
          .ok_or_else(|| ConfigError::UndefinedVariable { name: var.clone() }),
        ArgSource::Input { input } => Ok(ArgValue::Runtime(RuntimeRef {
          kind: DependencyKind::Input,
          name: input.clone(),
          path: None,
          expects_array: false,
        })),
        ArgSource::Param { param } => Ok(ArgValue::Runtime(RuntimeRef {
          kind: DependencyKind::Param,
          name: param.clone(),
          path: None,
          expects_array: false,
        })),
        ArgSource::With { with, path, array } => Ok(ArgValue::Runtime(RuntimeRef {
          kind: DependencyKind::With,
          name: with.clone(),
          path: path.clone(),
          expects_array: *array,
        })),
      }
    };

    if let Some(sql) = sql {
      let args = args.iter().map(bind).collect::<Result<Vec<_>, _>>()?;
      return Ok(ResolvedQuery {
        sql: sql.to_string(),
        args,
      });
    }

    let Some(query_name) = query else {
      return Err(ConfigError::MissingSql {
        resource: resource.to_string(),
      });
    };
    let query = self
      .query(query_name)
      .ok_or_else(|| ConfigError::QueryNotFound {
        resource: resource.to_string(),
        query: query_name.to_string(),
      })?;

    if query.params.is_empty() {
      let args = args.iter().map(bind).collect::<Result<Vec<_>, _>>()?;
      return Ok(ResolvedQuery {
        sql: query.sql.clone(),
        args,
      });
    }

    for arg in args {
      if let Some(name) = &arg.name
        && !query.params.iter().any(|param| &param.name == name)
      {
        return Err(ConfigError::UnknownArgument {
          query: query.name.clone(),
          arg: name.clone(),
        });
      }
    }

    let mut positional = args.iter().filter(|arg| arg.name.is_none());
    let mut bound = Vec::with_capacity(query.params.len());
    for param in &query.params {
      let named = args
        .iter()
        .find(|arg| arg.name.as_deref() == Some(param.name.as_str()));
      let value = match named.or_else(|| positional.next()) {
        Some(arg) => bind(arg)?,
        None => match &param.default {
          Some(default) => ArgValue::Static(default.clone()),
          None => {
            return Err(ConfigError::MissingArgument {
              query: query.name.clone(),
              param: param.name.clone(),
            });
          }
        },
      };
      bound.push(value);
    }

    Ok(ResolvedQuery {
      sql: query.sql.clone(),
      args: bound,
    })
  }
}

/// The mod a workspace belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
}

/// On-disk form of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDef {
  #[serde(rename = "mod")]
  pub mod_def: ModDef,
  #[serde(default)]
  pub variables: BTreeMap<String, serde_json::Value>,
  #[serde(default)]
  pub queries: Vec<QueryDef>,
  #[serde(default)]
  pub controls: Vec<ControlDef>,
  #[serde(default)]
  pub benchmarks: Vec<BenchmarkDef>,
  #[serde(default)]
  pub dashboards: Vec<DashboardDef>,
}

/// A validated, indexed workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
  mod_def: ModDef,
  variables: BTreeMap<String, serde_json::Value>,
  queries: HashMap<String, QueryDef>,
  controls: HashMap<String, ControlDef>,
  benchmarks: HashMap<String, BenchmarkDef>,
  dashboards: HashMap<String, DashboardDef>,
  /// Declaration order of benchmarks and controls.
  benchmark_order: Vec<String>,
  control_order: Vec<String>,
}

impl Workspace {
  /// Load and validate a workspace file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    let def: WorkspaceDef = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    let workspace = Self::new(def)?;
    info!(
      path = %path.display(),
      mod_name = %workspace.mod_def.name,
      controls = workspace.controls.len(),
      benchmarks = workspace.benchmarks.len(),
      dashboards = workspace.dashboards.len(),
      "workspace_loaded"
    );
    Ok(workspace)
  }

  /// Index and validate a workspace definition.
  pub fn new(def: WorkspaceDef) -> Result<Self, ConfigError> {
    let mut names = HashSet::new();
    let resource_names = def
      .controls
      .iter()
      .map(|c| &c.name)
      .chain(def.benchmarks.iter().map(|b| &b.name))
      .chain(def.dashboards.iter().map(|d| &d.name));
    for name in resource_names {
      if !names.insert(name.clone()) {
        return Err(ConfigError::DuplicateName { name: name.clone() });
      }
    }

    let mut queries = HashMap::new();
    for query in def.queries {
      if queries.contains_key(&query.name) {
        return Err(ConfigError::DuplicateName { name: query.name });
      }
      queries.insert(query.name.clone(), query);
    }

    let workspace = Self {
      benchmark_order: def.benchmarks.iter().map(|b| b.name.clone()).collect(),
      control_order: def.controls.iter().map(|c| c.name.clone()).collect(),
      mod_def: def.mod_def,
      variables: def.variables,
      queries,
      controls: def
        .controls
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect(),
      benchmarks: def
        .benchmarks
        .into_iter()
        .map(|b| (b.name.clone(), b))
        .collect(),
      dashboards: def
        .dashboards
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect(),
    };

    workspace.validate_controls()?;
    workspace.validate_benchmarks()?;
    workspace.validate_dashboards()?;
    Ok(workspace)
  }

  fn validate_controls(&self) -> Result<(), ConfigError> {
    for name in &self.control_order {
      let Some(control) = self.controls.get(name) else {
        continue;
      };
      match (&control.sql, &control.query) {
        (Some(_), Some(_)) => {
          return Err(ConfigError::InvalidResource {
            name: control.name.clone(),
            message: "sql and query are mutually exclusive".to_string(),
          });
        }
        (None, None) => {
          return Err(ConfigError::MissingSql {
            resource: control.name.clone(),
          });
        }
        (None, Some(query)) if !self.queries.contains_key(query) => {
          return Err(ConfigError::QueryNotFound {
            resource: control.name.clone(),
            query: query.clone(),
          });
        }
        _ => {}
      }
    }
    Ok(())
  }

  fn validate_benchmarks(&self) -> Result<(), ConfigError> {
    for name in &self.benchmark_order {
      let Some(benchmark) = self.benchmarks.get(name) else {
        continue;
      };
      for child in &benchmark.children {
        if !self.controls.contains_key(child) && !self.benchmarks.contains_key(child) {
          return Err(ConfigError::DanglingReference {
            parent: benchmark.name.clone(),
            child: child.clone(),
          });
        }
      }
    }

    // DFS with colouring: absent = unvisited, 1 = in progress, 2 = done
    fn visit<'a>(
      name: &'a str,
      benchmarks: &'a HashMap<String, BenchmarkDef>,
      colour: &mut HashMap<&'a str, u8>,
    ) -> Result<(), ConfigError> {
      colour.insert(name, 1);
      if let Some(benchmark) = benchmarks.get(name) {
        for child in &benchmark.children {
          if !benchmarks.contains_key(child) {
            continue;
          }
          match colour.get(child.as_str()) {
            Some(1) => {
              return Err(ConfigError::CycleDetected {
                name: child.clone(),
              });
            }
            Some(_) => {}
            None => visit(child, benchmarks, colour)?,
          }
        }
      }
      colour.insert(name, 2);
      Ok(())
    }

    let mut colour = HashMap::new();
    for name in &self.benchmark_order {
      if !colour.contains_key(name.as_str()) {
        visit(name, &self.benchmarks, &mut colour)?;
      }
    }
    Ok(())
  }

  fn validate_dashboards(&self) -> Result<(), ConfigError> {
    fn walk<'a>(
      nodes: &'a [NodeDef],
      names: &mut HashSet<&'a str>,
      workspace: &Workspace,
    ) -> Result<(), ConfigError> {
      for node in nodes {
        if !names.insert(node.name()) {
          return Err(ConfigError::DuplicateName {
            name: node.name().to_string(),
          });
        }
        match node {
          NodeDef::Container(def) => walk(&def.children, names, workspace)?,
          NodeDef::Leaf(def) => walk(&def.children, names, workspace)?,
          NodeDef::Check(def) => {
            if !workspace.controls.contains_key(&def.target)
              && !workspace.benchmarks.contains_key(&def.target)
            {
              return Err(ConfigError::DanglingReference {
                parent: def.name.clone(),
                child: def.target.clone(),
              });
            }
          }
          NodeDef::Input(_) | NodeDef::Text(_) => {}
        }
      }
      Ok(())
    }

    for dashboard in self.dashboards.values() {
      let mut names = HashSet::new();
      names.insert(dashboard.name.as_str());
      for input in &dashboard.inputs {
        if !names.insert(input.name.as_str()) {
          return Err(ConfigError::DuplicateName {
            name: input.name.clone(),
          });
        }
      }
      walk(&dashboard.children, &mut names, self)?;
    }
    Ok(())
  }
}

impl ResourceProvider for Workspace {
  fn mod_name(&self) -> &str {
    &self.mod_def.name
  }

  fn mod_title(&self) -> Option<&str> {
    self.mod_def.title.as_deref()
  }

  fn control(&self, name: &str) -> Option<&ControlDef> {
    self.controls.get(name)
  }

  fn benchmark(&self, name: &str) -> Option<&BenchmarkDef> {
    self.benchmarks.get(name)
  }

  fn dashboard(&self, name: &str) -> Option<&DashboardDef> {
    self.dashboards.get(name)
  }

  fn query(&self, name: &str) -> Option<&QueryDef> {
    self.queries.get(name)
  }

  fn variable(&self, name: &str) -> Option<&serde_json::Value> {
    self.variables.get(name)
  }

  fn top_level(&self) -> Vec<ResourceItem> {
    let nested: HashSet<&str> = self
      .benchmarks
      .values()
      .flat_map(|b| b.children.iter().map(String::as_str))
      .collect();

    let benchmarks = self
      .benchmark_order
      .iter()
      .filter(|name| !nested.contains(name.as_str()))
      .filter_map(|name| self.benchmarks.get(name))
      .map(|b| ResourceItem::Benchmark(b.clone()));
    let controls = self
      .control_order
      .iter()
      .filter(|name| !nested.contains(name.as_str()))
      .filter_map(|name| self.controls.get(name))
      .map(|c| ResourceItem::Control(c.clone()));
    benchmarks.chain(controls).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::ParamDef;
  use serde_json::json;

  fn workspace() -> Workspace {
    let def: WorkspaceDef = serde_json::from_value(json!({
      "mod": { "name": "compliance" },
      "variables": { "min_days": 90 },
      "queries": [{
        "name": "old_keys",
        "sql": "select * from keys where age > $1 and region = $2",
        "params": [
          { "name": "age" },
          { "name": "region", "default": "us-east-1" }
        ]
      }],
      "controls": [
        { "name": "c1", "sql": "select 1" },
        { "name": "c2", "sql": "select 2" },
        { "name": "loose", "sql": "select 3" }
      ],
      "benchmarks": [
        { "name": "root", "children": ["nested", "c1"] },
        { "name": "nested", "children": ["c2"] }
      ]
    }))
    .unwrap();
    Workspace::new(def).unwrap()
  }

  #[test]
  fn test_top_level_items() {
    let workspace = workspace();
    let names: Vec<_> = workspace
      .top_level()
      .iter()
      .map(|item| item.name().to_string())
      .collect();
    assert_eq!(names, vec!["root", "loose"]);
  }

  #[test]
  fn test_resolve_mod_and_all() {
    let workspace = workspace();
    for name in ["all", "compliance"] {
      let ResourceItem::Mod { children, .. } = workspace.resolve(name).unwrap() else {
        panic!("expected mod");
      };
      assert_eq!(children.len(), 2);
    }
    assert!(matches!(
      workspace.resolve("missing"),
      Err(ConfigError::NotFound { .. })
    ));
  }

  #[test]
  fn test_benchmark_children_in_order() {
    let workspace = workspace();
    let root = workspace.benchmark("root").unwrap().clone();
    let children = workspace.children(&root).unwrap();
    assert!(matches!(children[0], ResourceItem::Benchmark(_)));
    assert!(matches!(children[1], ResourceItem::Control(_)));
  }

  #[test]
  fn test_query_binding_named_positional_default() {
    let workspace = workspace();
    let args = vec![ArgDef::positional(ArgSource::Var {
      var: "min_days".to_string(),
    })];
    let resolved = workspace
      .resolve_query("c", None, Some("old_keys"), &args)
      .unwrap();
    assert_eq!(
      resolved.args,
      vec![ArgValue::Static(json!(90)), ArgValue::Static(json!("us-east-1"))]
    );

    let args = vec![
      ArgDef::named("region", ArgSource::Input {
        input: "region".to_string(),
      }),
      ArgDef::value(json!(30)),
    ];
    let resolved = workspace
      .resolve_query("c", None, Some("old_keys"), &args)
      .unwrap();
    assert_eq!(resolved.args[0], ArgValue::Static(json!(30)));
    assert_eq!(
      resolved.args[1].as_runtime().map(|r| r.dependency_name()),
      Some("input.region".to_string())
    );
  }

  #[test]
  fn test_query_binding_errors() {
    let workspace = workspace();
    assert_eq!(
      workspace.resolve_query("c", None, Some("old_keys"), &[]),
      Err(ConfigError::MissingArgument {
        query: "old_keys".to_string(),
        param: "age".to_string()
      })
    );
    let args = vec![ArgDef::named("colour", ArgSource::Value { value: json!(1) })];
    assert!(matches!(
      workspace.resolve_query("c", None, Some("old_keys"), &args),
      Err(ConfigError::UnknownArgument { .. })
    ));
    assert!(matches!(
      workspace.resolve_query("c", None, None, &[]),
      Err(ConfigError::MissingSql { .. })
    ));
    let args = vec![ArgDef::positional(ArgSource::Var {
      var: "nope".to_string(),
    })];
    assert!(matches!(
      workspace.resolve_query("c", Some("select $1"), None, &args),
      Err(ConfigError::UndefinedVariable { .. })
    ));
  }

  #[test]
  fn test_rejects_benchmark_cycle() {
    let def = WorkspaceDef {
      mod_def: ModDef {
        name: "m".to_string(),
        title: None,
      },
      variables: BTreeMap::new(),
      queries: vec![QueryDef {
        name: "q".to_string(),
        sql: "select 1".to_string(),
        params: vec![ParamDef {
          name: "p".to_string(),
          default: None,
          description: None,
        }],
      }],
      controls: vec![],
      benchmarks: vec![
        BenchmarkDef::new("a", vec!["b".to_string()]),
        BenchmarkDef::new("b", vec!["a".to_string()]),
      ],
      dashboards: vec![],
    };
    assert!(matches!(
      Workspace::new(def),
      Err(ConfigError::CycleDetected { .. })
    ));
  }

  #[test]
  fn test_rejects_dangling_child_and_duplicates() {
    let mut def = WorkspaceDef {
      mod_def: ModDef {
        name: "m".to_string(),
        title: None,
      },
      variables: BTreeMap::new(),
      queries: vec![],
      controls: vec![ControlDef::new("c", "select 1")],
      benchmarks: vec![BenchmarkDef::new("b", vec!["ghost".to_string()])],
      dashboards: vec![],
    };
    assert_eq!(
      Workspace::new(def.clone()).unwrap_err(),
      ConfigError::DanglingReference {
        parent: "b".to_string(),
        child: "ghost".to_string()
      }
    );

    def.benchmarks = vec![BenchmarkDef::new("c", vec![])];
    assert!(matches!(
      Workspace::new(def),
      Err(ConfigError::DuplicateName { .. })
    ));
  }
}
