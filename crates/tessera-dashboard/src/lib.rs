//! Dashboard execution for tessera.
//!
//! A dashboard is a tree of panels backed by queries. Panels run
//! concurrently; a panel whose query takes an input, a dashboard param or
//! another query's result (`with`) waits until that value is published.
//! Changing an input afterwards re-runs only the panels that consumed the
//! old value.

mod builder;
mod check;
mod container;
mod context;
mod dependency;
mod error;
mod events;
mod leaf;
mod node;
mod tree;

pub use builder::DashboardTreeBuilder;
pub use check::CheckRun;
pub use container::ContainerRun;
pub use dependency::{
  DependencyPublisher, DependencyValue, PropertyPath, Published, RuntimeDependency,
  stringify_json_columns,
};
pub use error::{DashboardError, DependencyError};
pub use events::{
  ChannelNotifier, DashboardEvent, DashboardNotifier, NodeSnapshot, NodeType, NoopNotifier,
};
pub use leaf::{LeafArg, LeafRun};
pub use node::RunNode;
pub use tree::DashboardExecutionTree;
