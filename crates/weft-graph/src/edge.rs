use serde::{Deserialize, Serialize};

pub const HANDLE_TRUE: &str = "true";
pub const HANDLE_FALSE: &str = "false";
pub const HANDLE_BODY: &str = "body";
pub const HANDLE_DONE: &str = "done";

/// A directed edge between two nodes.
///
/// `source_handle` selects which outgoing path of a branch (`true`/`false`)
/// or loop (`body`/`done`) node the edge belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GraphEdge {
    /// Create an edge with no handle. The id is derived from its endpoints.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: None,
            label: None,
        }
    }

    /// Create an edge leaving `source` through `handle`.
    pub fn with_handle(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        let handle = handle.into();
        Self {
            id: format!("{}:{}->{}", source, handle, target),
            source,
            target,
            source_handle: Some(handle),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn handle(&self) -> Option<&str> {
        self.source_handle.as_deref()
    }
}
