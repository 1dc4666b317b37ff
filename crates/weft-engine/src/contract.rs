use std::collections::HashMap;
use std::path::Path;

use jsonschema::JSONSchema;
use serde::Deserialize;
use tracing::{debug, warn};

use weft_core::config::{expand_env_vars, ContractsConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::{ContractRegistry, RoleContract};
use weft_core::types::Direction;

struct CompiledContract {
    contract: RoleContract,
    input: Option<JSONSchema>,
    output: Option<JSONSchema>,
}

/// Role contracts backed by compiled JSON Schemas.
#[derive(Default)]
pub struct SchemaContractRegistry {
    contracts: HashMap<String, CompiledContract>,
}

/// A contract file holds either one contract or a `contracts` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ContractFile {
    Many { contracts: Vec<RoleContract> },
    One(RoleContract),
}

impl SchemaContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a contract, replacing any earlier one for the role.
    pub fn register(&mut self, contract: RoleContract) -> Result<()> {
        let input = compile(&contract.role, Direction::Input, contract.input_schema.as_ref())?;
        let output = compile(&contract.role, Direction::Output, contract.output_schema.as_ref())?;
        self.contracts.insert(
            contract.role.clone(),
            CompiledContract {
                contract,
                input,
                output,
            },
        );
        Ok(())
    }

    /// Load contracts from a TOML, JSON or YAML file.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let file: ContractFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&expanded)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&expanded)?,
            Some("toml") => toml::from_str(&expanded)?,
            other => {
                return Err(WeftError::Config(format!(
                    "unsupported contract format: {}",
                    other.unwrap_or("<none>")
                )))
            }
        };
        let contracts = match file {
            ContractFile::Many { contracts } => contracts,
            ContractFile::One(c) => vec![c],
        };
        let count = contracts.len();
        for contract in contracts {
            self.register(contract)?;
        }
        debug!(path = %path.display(), count, "Loaded role contracts");
        Ok(count)
    }

    /// Load every contract file listed in the `[contracts]` config section,
    /// plus every supported file in its directory.
    pub fn from_config(config: &ContractsConfig) -> Result<Self> {
        let mut registry = Self::new();
        for file in &config.files {
            registry.load_file(Path::new(file))?;
        }
        if let Some(dir) = &config.dir {
            let mut paths: Vec<_> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("json" | "yaml" | "yml" | "toml")
                    )
                })
                .collect();
            paths.sort();
            for path in paths {
                registry.load_file(&path)?;
            }
        }
        Ok(registry)
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.contracts.keys().map(|s| s.as_str()).collect();
        roles.sort_unstable();
        roles
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

fn compile(
    role: &str,
    direction: Direction,
    schema: Option<&serde_json::Value>,
) -> Result<Option<JSONSchema>> {
    let Some(schema) = schema else {
        return Ok(None);
    };
    JSONSchema::compile(schema).map(Some).map_err(|e| {
        WeftError::Config(format!(
            "invalid {} schema for role '{}': {}",
            direction, role, e
        ))
    })
}

impl ContractRegistry for SchemaContractRegistry {
    fn get_contract(&self, role: &str) -> Option<&RoleContract> {
        self.contracts.get(role).map(|c| &c.contract)
    }

    fn validate(&self, role: &str, payload: &serde_json::Value, direction: Direction) -> Result<()> {
        let Some(compiled) = self.contracts.get(role) else {
            return Ok(());
        };
        let schema = match direction {
            Direction::Input => compiled.input.as_ref(),
            Direction::Output => compiled.output.as_ref(),
        };
        let Some(schema) = schema else {
            return Ok(());
        };
        schema.validate(payload).map_err(|errors| {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            warn!(role, %direction, errors = messages.len(), "Contract violation");
            WeftError::ContractViolation {
                role: role.to_string(),
                direction,
                message: messages.join("; "),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tester_contract() -> RoleContract {
        RoleContract {
            role: "tester".into(),
            description: None,
            input_schema: Some(json!({
                "type": "object",
                "required": ["code"],
                "properties": {"code": {"type": "string"}}
            })),
            output_schema: Some(json!({
                "type": "object",
                "required": ["passed"],
                "properties": {"passed": {"type": "boolean"}}
            })),
            required_context: vec![],
        }
    }

    #[test]
    fn test_validate_directions() {
        let mut registry = SchemaContractRegistry::new();
        registry.register(tester_contract()).unwrap();

        assert!(registry
            .validate("tester", &json!({"code": "fn main() {}"}), Direction::Input)
            .is_ok());
        let err = registry
            .validate("tester", &json!({"other": 1}), Direction::Input)
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::ContractViolation { direction: Direction::Input, .. }
        ));
        assert!(registry
            .validate("tester", &json!({"passed": "yes"}), Direction::Output)
            .is_err());
    }

    #[test]
    fn test_unknown_role_passes() {
        let registry = SchemaContractRegistry::new();
        assert!(registry.validate("nobody", &json!(null), Direction::Input).is_ok());
        assert!(registry.get_contract("nobody").is_none());
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = SchemaContractRegistry::new();
        let bad = RoleContract {
            role: "broken".into(),
            input_schema: Some(json!({"type": 12})),
            ..Default::default()
        };
        assert!(matches!(registry.register(bad), Err(WeftError::Config(_))));
    }

    #[test]
    fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("roles.yaml");
        std::fs::write(
            &yaml,
            r#"
contracts:
  - role: builder
    output_schema:
      type: object
      required: [code]
  - role: reviewer
    required_context: [diff]
"#,
        )
        .unwrap();
        let json_path = dir.path().join("tester.json");
        std::fs::write(&json_path, serde_json::to_string(&tester_contract()).unwrap()).unwrap();

        let registry = SchemaContractRegistry::from_config(&ContractsConfig {
            files: vec![],
            dir: Some(dir.path().display().to_string()),
        })
        .unwrap();
        assert_eq!(registry.roles(), vec!["builder", "reviewer", "tester"]);
        assert_eq!(registry.get_contract("reviewer").unwrap().required_context, vec!["diff"]);
        assert!(registry.get_contract("tester").unwrap().required_context.is_empty());
        assert!(registry
            .validate("builder", &json!({}), Direction::Output)
            .is_err());
    }
}
