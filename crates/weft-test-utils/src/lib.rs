//! Mock handlers, recording sinks and workflow fixtures shared by Weft tests.

pub mod fixtures;
pub mod handlers;
pub mod sinks;

pub use fixtures::*;
pub use handlers::*;
pub use sinks::*;
