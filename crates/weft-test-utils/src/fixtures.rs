use std::sync::Arc;

use weft_core::config::AppConfig;
use weft_graph::WorkflowDescriptor;

/// Parse a YAML workflow, panicking on error.
pub fn workflow(yaml: &str) -> WorkflowDescriptor {
    WorkflowDescriptor::from_yaml_str(yaml).expect("fixture workflow parses")
}

/// Engine config with short backoffs so retry tests stay fast.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.engine.step_timeout_secs = 5;
    config
}

/// `a -> b -> c`, each declaring one output.
pub const LINEAR: &str = r#"
id: linear
name: Linear
steps:
  - id: a
    type: shell
    outputs: [a_out]
  - id: b
    type: shell
    depends_on: [a]
    outputs: [b_out]
  - id: c
    type: shell
    depends_on: [b]
    outputs: [c_out]
"#;

/// `root` fans out to `left` and `right`, which join into `join`.
pub const DIAMOND: &str = r#"
id: diamond
name: Diamond
steps:
  - id: root
    type: shell
  - id: left
    type: shell
    depends_on: [root]
  - id: right
    type: shell
    depends_on: [root]
  - id: join
    type: shell
    depends_on: [left, right]
"#;

/// A branch on `input.flag` with one step per side and a join behind each.
pub const BRANCHING: &str = r#"
id: branching
name: Branching
inputs:
  - name: flag
    default: true
steps:
  - id: gate
    type: branch
    branch: { field: flag, operator: equals, value: true }
  - id: approve
    type: shell
    depends_on: ["gate:true"]
  - id: reject
    type: shell
    depends_on: ["gate:false"]
  - id: after_reject
    type: shell
    depends_on: [reject]
"#;

/// Count loop running `work` three times, then `after`.
pub const COUNT_LOOP: &str = r#"
id: looping
name: Looping
steps:
  - id: prep
    type: shell
  - id: repeat
    type: loop
    loop: { type: count, count: 3 }
    depends_on: [prep, work]
  - id: work
    type: shell
    depends_on: ["repeat:body"]
    outputs: [work_out]
  - id: after
    type: shell
    depends_on: ["repeat:done"]
"#;

/// Shared handle to anything the tests want to inspect after a run.
pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_parse() {
        for yaml in [LINEAR, DIAMOND, BRANCHING, COUNT_LOOP] {
            let wf = workflow(yaml);
            wf.to_graph().expect("fixture graph is valid");
        }
    }
}
