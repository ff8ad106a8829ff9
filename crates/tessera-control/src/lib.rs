//! Control execution for tessera.
//!
//! Controls are policy checks whose queries classify resources as `ok`,
//! `alarm`, `info`, `skip` or `error`. Benchmarks group controls into a
//! hierarchy; this crate runs such a hierarchy against a query backend with a
//! tree-wide concurrency cap and aggregates outcome counts bottom-up.
//!
//! ```text
//! root (synthetic)
//! └── benchmark            ResultGroup
//!     ├── control          ControlRun
//!     └── benchmark        ResultGroup
//!         └── control      ControlRun
//! ```

mod colour;
mod context;
mod error;
mod events;
mod filter;
mod group;
mod report;
mod row;
mod run;
mod summary;
mod tree;

pub use colour::DimensionColours;
pub use error::ControlError;
pub use events::{ChannelNotifier, ControlEvent, ControlNotifier, NoopNotifier};
pub use filter::{CONTROL_VIEW, control_allow_list, filter_clause, tag_clause};
pub use group::{GroupChild, ResultGroup};
pub use report::{ControlReport, GroupReport, ReportNode, TreeReport};
pub use row::ControlRow;
pub use run::ControlRun;
pub use summary::{ControlStatus, StatusSummary};
pub use tree::{ControlExecutionTree, ControlTreeBuilder, ROOT_NAME};
