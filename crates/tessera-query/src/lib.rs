//! Backend contract for the tessera execution engine.
//!
//! The engine treats the query backend as an opaque service: it acquires
//! sessions, submits statements, consumes streamed rows and releases the
//! sessions again. [`MemoryClient`] is a scripted implementation used by the
//! test suites and the CLI.

mod client;
mod error;
mod memory;

pub use client::{
  AlwaysReady, ColumnDef, ConnectionReadiness, DataType, QueryClient, QueryResult, Row, RowStream,
  Session, SyncResult, search_path_statement,
};
pub use error::QueryError;
pub use memory::{Execution, MemoryClient, MemoryFixture, RowError, ScriptedResponse};
