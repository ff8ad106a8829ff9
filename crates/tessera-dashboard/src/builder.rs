//! Turns a dashboard definition into a run-node tree.
//!
//! Every runtime argument is bound while the tree is built: inputs and params
//! to the dashboard's publisher, `with.x` to the nearest enclosing scope that
//! declares `x`. References to anything undeclared, and cycles between
//! withs, fail the build.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tessera_config::{
  ArgDef, ArgValue, ConfigError, DashboardDef, DependencyKind, ExecutionConfig, InputDef, NodeDef,
  ResolvedQuery, ResourceProvider, RuntimeRef, WithDef,
};
use tessera_query::{AlwaysReady, ConnectionReadiness, QueryClient};
use tracing::info;

use crate::check::CheckRun;
use crate::container::ContainerRun;
use crate::context::DashboardContext;
use crate::dependency::{DependencyPublisher, RuntimeDependency};
use crate::error::DashboardError;
use crate::events::{DashboardNotifier, NodeType, NoopNotifier};
use crate::leaf::{LeafArg, LeafRun, LeafSpec, Publication};
use crate::node::RunNode;
use crate::tree::{DashboardExecutionTree, TreeParts};

/// Builds a [`DashboardExecutionTree`].
pub struct DashboardTreeBuilder {
  client: Arc<dyn QueryClient>,
  provider: Arc<dyn ResourceProvider>,
  readiness: Arc<dyn ConnectionReadiness>,
  config: ExecutionConfig,
  notifier: Arc<dyn DashboardNotifier>,
  params: BTreeMap<String, Value>,
  session_id: Option<String>,
}

impl DashboardTreeBuilder {
  pub fn new(client: Arc<dyn QueryClient>, provider: Arc<dyn ResourceProvider>) -> Self {
    Self {
      client,
      provider,
      readiness: Arc::new(AlwaysReady),
      config: ExecutionConfig::default(),
      notifier: Arc::new(NoopNotifier),
      params: BTreeMap::new(),
      session_id: None,
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

  pub fn notifier(mut self, notifier: Arc<dyn DashboardNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Override a declared dashboard param.
  pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
    self.params.insert(name.into(), value);
    self
  }

  /// Client session the tree's events are addressed to. Defaults to the
  /// execution id.
  pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
    self.session_id = Some(session_id.into());
    self
  }

  pub fn build(self, dashboard: &str) -> Result<DashboardExecutionTree, DashboardError> {
    let def = self
      .provider
      .dashboard(dashboard)
      .cloned()
      .ok_or_else(|| ConfigError::NotFound {
        name: dashboard.to_string(),
      })?;

    let mut params: BTreeMap<String, Option<Value>> = def
      .params
      .iter()
      .map(|param| (param.name.clone(), param.default.clone()))
      .collect();
    for (name, value) in self.params {
      let Some(slot) = params.get_mut(&name) else {
        return Err(DashboardError::invalid(format!(
          "dashboard '{}' has no param '{name}'",
          def.name
        )));
      };
      *slot = Some(value);
    }

    let execution_id = uuid::Uuid::new_v4().to_string();
    let context = Arc::new(DashboardContext {
      session_id: self.session_id.unwrap_or_else(|| execution_id.clone()),
      execution_id,
      client: self.client,
      provider: self.provider,
      readiness: self.readiness,
      config: self.config,
      notifier: self.notifier,
    });

    let mut factory = NodeFactory {
      context: Arc::clone(&context),
      variables: Arc::new(DependencyPublisher::new()),
      inputs: declared_inputs(&def),
      params: params.keys().cloned().collect(),
      scopes: Vec::new(),
      nodes: BTreeMap::new(),
      input_dependents: BTreeMap::new(),
      with_dependents: BTreeMap::new(),
      with_edges: BTreeMap::new(),
    };
    let root = factory.dashboard(&def)?;
    factory.check_with_cycles()?;

    info!(
      execution_id = %context.execution_id,
      dashboard = %def.name,
      nodes = factory.nodes.len(),
      "dashboard_tree_built"
    );

    Ok(DashboardExecutionTree::new(TreeParts {
      dashboard: def.name,
      root,
      nodes: factory.nodes,
      context,
      variables: factory.variables,
      inputs: factory.inputs,
      params,
      input_dependents: factory.input_dependents,
      with_dependents: factory.with_dependents,
    }))
  }
}

/// Inputs declared on the dashboard or anywhere in its node tree.
fn declared_inputs(def: &DashboardDef) -> BTreeSet<String> {
  fn walk(nodes: &[NodeDef], inputs: &mut BTreeSet<String>) {
    for node in nodes {
      match node {
        NodeDef::Input(input) => {
          inputs.insert(input.name.clone());
        }
        NodeDef::Container(container) => walk(&container.children, inputs),
        NodeDef::Leaf(leaf) => walk(&leaf.children, inputs),
        NodeDef::Check(_) | NodeDef::Text(_) => {}
      }
    }
  }

  let mut inputs: BTreeSet<String> = def.inputs.iter().map(|input| input.name.clone()).collect();
  walk(&def.children, &mut inputs);
  inputs
}

fn with_node_name(owner: &str, with: &str) -> String {
  format!("{owner}.with.{with}")
}

/// Withs visible to the nodes being built.
struct Scope {
  publisher: Arc<DependencyPublisher>,
  /// with name to node name
  withs: HashMap<String, String>,
}

struct NodeFactory {
  context: Arc<DashboardContext>,
  /// Publishes inputs and params.
  variables: Arc<DependencyPublisher>,
  inputs: BTreeSet<String>,
  params: BTreeSet<String>,
  scopes: Vec<Scope>,
  nodes: BTreeMap<String, RunNode>,
  input_dependents: BTreeMap<String, BTreeSet<String>>,
  with_dependents: BTreeMap<String, BTreeSet<String>>,
  /// with node to the with nodes it references
  with_edges: BTreeMap<String, BTreeSet<String>>,
}

impl NodeFactory {
  fn register(&mut self, node: RunNode) -> Result<RunNode, DashboardError> {
    let name = node.name().to_string();
    if self.nodes.contains_key(&name) {
      return Err(DashboardError::invalid(format!("duplicate node name '{name}'")));
    }
    self.nodes.insert(name, node.clone());
    Ok(node)
  }

  /// Push a scope for `owner`'s withs, if it declares any.
  fn open_scope(
    &mut self,
    owner: &str,
    withs: &[WithDef],
  ) -> Result<Option<Arc<DependencyPublisher>>, DashboardError> {
    if withs.is_empty() {
      return Ok(None);
    }
    let mut names = HashMap::new();
    for with in withs {
      if names
        .insert(with.name.clone(), with_node_name(owner, &with.name))
        .is_some()
      {
        return Err(DashboardError::invalid(format!(
          "'{owner}' declares with '{}' twice",
          with.name
        )));
      }
    }
    let publisher = Arc::new(DependencyPublisher::new());
    self.scopes.push(Scope {
      publisher: Arc::clone(&publisher),
      withs: names,
    });
    Ok(Some(publisher))
  }

  fn close_scope(&mut self, scope: &Option<Arc<DependencyPublisher>>) {
    if scope.is_some() {
      self.scopes.pop();
    }
  }

  fn withs(
    &mut self,
    owner: &str,
    withs: &[WithDef],
    scope: &Option<Arc<DependencyPublisher>>,
  ) -> Result<Vec<Arc<LeafRun>>, DashboardError> {
    let Some(publisher) = scope else {
      return Ok(Vec::new());
    };

    let mut runs = Vec::with_capacity(withs.len());
    for with in withs {
      let name = with_node_name(owner, &with.name);
      let query = self.context.provider.resolve_query(
        &name,
        with.sql.as_deref(),
        with.query.as_deref(),
        &with.args,
      )?;
      let args = self.bind(&name, &query, true)?;
      let run = Arc::new(LeafRun::new(
        LeafSpec {
          name,
          title: Some(with.name.clone()),
          node_type: NodeType::With,
          display: None,
          text: None,
          parent: owner.to_string(),
          sql: Some(query.sql),
          args,
          children: Vec::new(),
          withs: Vec::new(),
          publication: Some(Publication {
            publisher: Arc::clone(publisher),
            name: format!("with.{}", with.name),
          }),
        },
        Arc::clone(&self.context),
      ));
      self.register(RunNode::Leaf(Arc::clone(&run)))?;
      runs.push(run);
    }
    Ok(runs)
  }

  fn bind(
    &mut self,
    node: &str,
    query: &ResolvedQuery,
    is_with: bool,
  ) -> Result<Vec<LeafArg>, DashboardError> {
    let mut args = Vec::with_capacity(query.args.len());
    for arg in &query.args {
      args.push(match arg {
        ArgValue::Static(value) => LeafArg::Static(value.clone()),
        ArgValue::Runtime(reference) => {
          LeafArg::Runtime(Arc::new(self.dependency(node, reference, is_with)?))
        }
      });
    }
    Ok(args)
  }

  fn dependency(
    &mut self,
    node: &str,
    reference: &RuntimeRef,
    is_with: bool,
  ) -> Result<RuntimeDependency, DashboardError> {
    let publisher = match reference.kind {
      DependencyKind::Input => {
        if !self.inputs.contains(&reference.name) {
          return Err(DashboardError::invalid(format!(
            "'{node}' references undeclared input '{}'",
            reference.name
          )));
        }
        self
          .input_dependents
          .entry(reference.name.clone())
          .or_default()
          .insert(node.to_string());
        Arc::clone(&self.variables)
      }
      DependencyKind::Param => {
        if !self.params.contains(&reference.name) {
          return Err(DashboardError::invalid(format!(
            "'{node}' references undeclared param '{}'",
            reference.name
          )));
        }
        Arc::clone(&self.variables)
      }
      DependencyKind::With => {
        let (publisher, with_node) = self
          .scopes
          .iter()
          .rev()
          .find_map(|scope| {
            scope
              .withs
              .get(&reference.name)
              .map(|with_node| (Arc::clone(&scope.publisher), with_node.clone()))
          })
          .ok_or_else(|| {
            DashboardError::invalid(format!(
              "'{node}' references undeclared with '{}'",
              reference.name
            ))
          })?;
        self
          .with_dependents
          .entry(with_node.clone())
          .or_default()
          .insert(node.to_string());
        if is_with {
          self
            .with_edges
            .entry(node.to_string())
            .or_default()
            .insert(with_node);
        }
        publisher
      }
    };
    Ok(RuntimeDependency::new(reference.clone(), publisher))
  }

  fn query(
    &mut self,
    node: &str,
    sql: Option<&str>,
    query: Option<&str>,
    args: &[ArgDef],
  ) -> Result<(Option<String>, Vec<LeafArg>), DashboardError> {
    if sql.is_none() && query.is_none() {
      return Ok((None, Vec::new()));
    }
    let resolved = self.context.provider.resolve_query(node, sql, query, args)?;
    let args = self.bind(node, &resolved, false)?;
    Ok((Some(resolved.sql), args))
  }

  fn dashboard(&mut self, def: &DashboardDef) -> Result<Arc<ContainerRun>, DashboardError> {
    let scope = self.open_scope(&def.name, &def.with)?;
    let withs = self.withs(&def.name, &def.with, &scope)?;
    let mut children = Vec::with_capacity(def.inputs.len() + def.children.len());
    for input in &def.inputs {
      children.push(self.input(input, &def.name)?);
    }
    for child in &def.children {
      children.push(self.node(child, &def.name)?);
    }
    self.close_scope(&scope);

    let root = Arc::new(ContainerRun::new(
      def.name.clone(),
      def.title.clone(),
      NodeType::Dashboard,
      None,
      children,
      withs,
      Arc::clone(&self.context),
    ));
    self.register(RunNode::Container(Arc::clone(&root)))?;
    Ok(root)
  }

  fn input(&mut self, def: &InputDef, parent: &str) -> Result<RunNode, DashboardError> {
    let (sql, args) = self.query(&def.name, def.sql.as_deref(), def.query.as_deref(), &def.args)?;
    let run = LeafRun::new(
      LeafSpec {
        name: def.name.clone(),
        title: def.title.clone(),
        node_type: NodeType::Input,
        display: def.display.clone(),
        text: None,
        parent: parent.to_string(),
        sql,
        args,
        children: Vec::new(),
        withs: Vec::new(),
        publication: None,
      },
      Arc::clone(&self.context),
    );
    self.register(RunNode::Leaf(Arc::new(run)))
  }

  fn node(&mut self, def: &NodeDef, parent: &str) -> Result<RunNode, DashboardError> {
    match def {
      NodeDef::Container(container) => {
        let scope = self.open_scope(&container.name, &container.with)?;
        let withs = self.withs(&container.name, &container.with, &scope)?;
        let children = container
          .children
          .iter()
          .map(|child| self.node(child, &container.name))
          .collect::<Result<Vec<_>, _>>()?;
        self.close_scope(&scope);

        let run = ContainerRun::new(
          container.name.clone(),
          container.title.clone(),
          NodeType::Container,
          Some(parent.to_string()),
          children,
          withs,
          Arc::clone(&self.context),
        );
        self.register(RunNode::Container(Arc::new(run)))
      }
      NodeDef::Leaf(leaf) => {
        let scope = self.open_scope(&leaf.name, &leaf.with)?;
        let withs = self.withs(&leaf.name, &leaf.with, &scope)?;
        let children = leaf
          .children
          .iter()
          .map(|child| self.node(child, &leaf.name))
          .collect::<Result<Vec<_>, _>>()?;
        let (sql, args) = self.query(&leaf.name, leaf.sql.as_deref(), leaf.query.as_deref(), &leaf.args)?;
        self.close_scope(&scope);

        let run = LeafRun::new(
          LeafSpec {
            name: leaf.name.clone(),
            title: leaf.title.clone(),
            node_type: NodeType::Leaf,
            display: leaf.display.clone(),
            text: None,
            parent: parent.to_string(),
            sql,
            args,
            children,
            withs,
            publication: None,
          },
          Arc::clone(&self.context),
        );
        self.register(RunNode::Leaf(Arc::new(run)))
      }
      NodeDef::Input(input) => self.input(input, parent),
      NodeDef::Check(check) => {
        // fail at build time on an unknown target
        self.context.provider.resolve(&check.target)?;
        let run = CheckRun::new(
          check.name.clone(),
          check.title.clone(),
          check.target.clone(),
          parent.to_string(),
          Arc::clone(&self.context),
        );
        self.register(RunNode::Check(Arc::new(run)))
      }
      NodeDef::Text(text) => {
        let run = LeafRun::new(
          LeafSpec {
            name: text.name.clone(),
            title: text.title.clone(),
            node_type: NodeType::Text,
            display: None,
            text: Some(text.value.clone()),
            parent: parent.to_string(),
            sql: None,
            args: Vec::new(),
            children: Vec::new(),
            withs: Vec::new(),
            publication: None,
          },
          Arc::clone(&self.context),
        );
        self.register(RunNode::Leaf(Arc::new(run)))
      }
    }
  }

  /// Reject withs that reference each other in a cycle.
  fn check_with_cycles(&self) -> Result<(), DashboardError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Visiting,
      Done,
    }

    fn visit<'a>(
      node: &'a str,
      edges: &'a BTreeMap<String, BTreeSet<String>>,
      marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), String> {
      match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => return Err(node.to_string()),
        None => {}
      }
      marks.insert(node, Mark::Visiting);
      if let Some(targets) = edges.get(node) {
        for target in targets {
          visit(target, edges, marks)?;
        }
      }
      marks.insert(node, Mark::Done);
      Ok(())
    }

    let mut marks = HashMap::new();
    for node in self.with_edges.keys() {
      visit(node, &self.with_edges, &mut marks).map_err(|name| {
        DashboardError::invalid(format!("with dependency cycle through '{name}'"))
      })?;
    }
    Ok(())
  }
}
