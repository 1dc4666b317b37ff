use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WeftError};

/// Owner recorded for keys seeded from workflow inputs.
pub const INPUT_OWNER: &str = "input";

/// Shared data passed between steps of a run.
///
/// Keys are write-once: the first step to publish a key owns it, and only that
/// step may write it again (loop iterations, resumed attempts). Values are JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    owners: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from workflow inputs.
    pub fn from_inputs(inputs: HashMap<String, serde_json::Value>) -> Self {
        let owners = inputs
            .keys()
            .map(|k| (k.clone(), INPUT_OWNER.to_string()))
            .collect();
        Self {
            data: inputs,
            owners,
        }
    }

    /// Look up a key. Dotted paths (`review.status`) descend into objects and
    /// arrays when no key with that exact name exists.
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        if let Some(v) = self.data.get(path) {
            return Some(v);
        }
        let parts: Vec<&str> = path.split('.').collect();
        // Longest prefix first so "loop.iteration"-style flat keys win.
        for split in (1..parts.len()).rev() {
            let head = parts[..split].join(".");
            if let Some(root) = self.data.get(&head) {
                if let Some(v) = descend(root, &parts[split..]) {
                    return Some(v);
                }
            }
        }
        None
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Publish a value on behalf of `owner`.
    pub fn publish(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        owner: &str,
    ) -> Result<()> {
        let key = key.into();
        if let Some(existing) = self.owners.get(&key) {
            if existing != owner {
                warn!(key = %key, owner = %existing, writer = %owner, "Rejected context write");
                return Err(WeftError::ContextConflict {
                    key,
                    owner: existing.clone(),
                });
            }
        }
        self.owners.insert(key.clone(), owner.to_string());
        self.data.insert(key, value);
        Ok(())
    }

    /// Publish a step's declared outputs.
    ///
    /// For each key, an object output contributes its field of that name;
    /// anything else (or a missing field) stores the whole output. Ownership
    /// of every key is checked before anything is written: keys owned by
    /// another writer are skipped and returned as `ContextConflict` errors,
    /// the rest are all published.
    pub fn ingest_output(
        &mut self,
        owner: &str,
        output_keys: &[String],
        output: &serde_json::Value,
    ) -> Vec<WeftError> {
        let (writable, conflicts): (Vec<&String>, Vec<&String>) = output_keys
            .iter()
            .partition(|key| self.owners.get(*key).map_or(true, |o| o == owner));

        for key in writable {
            let value = output
                .as_object()
                .and_then(|obj| obj.get(key))
                .cloned()
                .unwrap_or_else(|| output.clone());
            self.owners.insert(key.clone(), owner.to_string());
            self.data.insert(key.clone(), value);
        }

        conflicts
            .into_iter()
            .map(|key| {
                WeftError::ContextConflict {
                    key: key.clone(),
                    owner: self.owners.get(key).cloned().unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Drop every key written by `owner`. Returns the removed keys.
    pub fn retract_owned_by(&mut self, owner: &str) -> Vec<String> {
        let keys: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &keys {
            self.owners.remove(k);
            self.data.remove(k);
        }
        keys
    }

    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owners.get(key).map(|s| s.as_str())
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn descend<'a>(mut value: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    for seg in path {
        value = match value {
            serde_json::Value::Object(map) => map.get(*seg)?,
            serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_and_get() {
        let mut ctx = ExecutionContext::new();
        ctx.publish("count", json!(42), "counter").unwrap();
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.owner("count"), Some("counter"));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_dotted_path() {
        let mut ctx = ExecutionContext::new();
        ctx.publish("review", json!({"status": "approved", "notes": ["a", "b"]}), "reviewer")
            .unwrap();
        assert_eq!(ctx.get_str("review.status"), Some("approved"));
        assert_eq!(ctx.get_str("review.notes.1"), Some("b"));
        assert_eq!(ctx.get("review.missing"), None);
    }

    #[test]
    fn test_flat_dotted_key_wins() {
        let mut ctx = ExecutionContext::new();
        ctx.publish("retry_loop.iteration", json!(2), "retry_loop").unwrap();
        assert_eq!(ctx.get("retry_loop.iteration"), Some(&json!(2)));
    }

    #[test]
    fn test_conflicting_write_rejected() {
        let mut ctx = ExecutionContext::new();
        ctx.publish("summary", json!("one"), "a").unwrap();
        let err = ctx.publish("summary", json!("two"), "b").unwrap_err();
        assert!(matches!(err, WeftError::ContextConflict { ref owner, .. } if owner == "a"));
        assert_eq!(ctx.get_str("summary"), Some("one"));
        // Same owner may rewrite.
        ctx.publish("summary", json!("three"), "a").unwrap();
        assert_eq!(ctx.get_str("summary"), Some("three"));
    }

    #[test]
    fn test_ingest_object_output() {
        let mut ctx = ExecutionContext::new();
        let output = json!({"findings": "Rust is fast", "score": 9.5});
        assert!(ctx
            .ingest_output("research", &["findings".into(), "score".into()], &output)
            .is_empty());
        assert_eq!(ctx.get_str("findings"), Some("Rust is fast"));
        assert_eq!(ctx.get("score"), Some(&json!(9.5)));
    }

    #[test]
    fn test_ingest_plain_output() {
        let mut ctx = ExecutionContext::new();
        assert!(ctx
            .ingest_output("writer", &["summary".into()], &json!("plain text"))
            .is_empty());
        assert_eq!(ctx.get_str("summary"), Some("plain text"));
    }

    #[test]
    fn test_ingest_skips_conflicting_keys() {
        let mut ctx = ExecutionContext::from_inputs(HashMap::from([("summary".into(), json!("draft"))]));
        let output = json!({"summary": "final", "words": 120});
        let conflicts = ctx.ingest_output("write", &["summary".into(), "words".into()], &output);

        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            &conflicts[0],
            WeftError::ContextConflict { key, owner } if key == "summary" && owner == INPUT_OWNER
        ));
        assert_eq!(ctx.get_str("summary"), Some("draft"));
        assert_eq!(ctx.get("words"), Some(&json!(120)));
        assert_eq!(ctx.owner("words"), Some("write"));
    }

    #[test]
    fn test_retract_owned_by() {
        let mut ctx = ExecutionContext::from_inputs(HashMap::from([("topic".into(), json!("AI"))]));
        ctx.publish("draft", json!("v1"), "body").unwrap();
        ctx.publish("body_status", json!("success"), "body").unwrap();
        let mut removed = ctx.retract_owned_by("body");
        removed.sort();
        assert_eq!(removed, vec!["body_status", "draft"]);
        assert!(!ctx.contains("draft"));
        assert_eq!(ctx.get_str("topic"), Some("AI"));
        assert_eq!(ctx.owner("topic"), Some(INPUT_OWNER));
    }
}
