//! Run-state vocabulary shared by the control and dashboard trees.

mod guard;
mod state;
mod status;

pub use guard::{catch_panic, panic_message};
pub use state::RunState;
pub use status::RunStatus;
