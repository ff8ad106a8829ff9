//! Tessera Config
//!
//! Serializable resource definitions consumed by the execution trees:
//! controls, benchmarks, named queries and dashboards, plus the engine
//! settings in [`ExecutionConfig`].
//!
//! Definitions are loaded from a JSON workspace file and served to the
//! execution trees through the [`ResourceProvider`] contract. Query-bearing
//! resources resolve to SQL text and a list of arguments; arguments that
//! depend on other nodes at runtime stay symbolic as [`RuntimeRef`]s.

mod arg;
mod control;
mod dashboard;
mod error;
mod execution;
mod workspace;

pub use arg::{ArgDef, ArgSource, ArgValue, DependencyKind, ResolvedQuery, RuntimeRef};
pub use control::{BenchmarkDef, ControlDef, ParamDef, QueryDef};
pub use dashboard::{
  CheckDef, ContainerDef, DashboardDef, InputDef, LeafDef, NodeDef, TextDef, WithDef,
};
pub use error::ConfigError;
pub use execution::ExecutionConfig;
pub use workspace::{ModDef, ResourceItem, ResourceProvider, Workspace, WorkspaceDef};
