//! Execution engine for Weft workflows.

pub mod checkpoint;
pub mod contract;
pub mod coordinator;
pub mod executor;
pub mod handlers;
pub mod retry;
pub mod run_log;
pub mod state;

pub use checkpoint::{MemoryCheckpointStore, SqliteCheckpointStore};
pub use contract::SchemaContractRegistry;
pub use coordinator::{Intent, IntentResolver, OverlapResolver, StabilityGate};
pub use executor::{check_preconditions, Executor, ExecutorBuilder, Precondition, RunOptions, RunReport};
pub use handlers::{DryRunHandler, HandlerRegistry};
pub use run_log::{EventSink, RunLogger};
pub use state::StepResult;
