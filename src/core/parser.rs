//! KN-009: Module file parsing and validation.
//!
//! Parses module YAML files and validates structural constraints:
//! - Module and contract ids must be identifiers
//! - Every contract names a kind
//! - `{future: id}` arguments and `after` entries must reference declared contracts
//! - Output bindings must reference declared contracts
//!
//! A file that validates cleanly converts into the same [`Module`] that
//! `build_module` produces.

use super::error::{KilnError, Result};
use super::registry::{is_valid_id, module_from_parts};
use super::types::{ArgValue, Descriptor, Module};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Root of a module file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleFile {
    pub module: String,

    /// Contract declarations, in declaration order
    #[serde(default)]
    pub contracts: IndexMap<String, ContractDecl>,

    /// Exposed name -> contract id; every contract when omitted
    #[serde(default)]
    pub outputs: Option<IndexMap<String, String>>,
}

/// One contract declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractDecl {
    /// Contract name passed to the creator
    pub contract: String,

    #[serde(default)]
    pub args: Vec<ArgValue>,

    #[serde(default)]
    pub after: Vec<String>,
}

/// Parse a module file from disk.
pub fn parse_module_file(path: &Path) -> Result<ModuleFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| KilnError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    parse_module(&content)
}

/// Parse a module file from a string.
pub fn parse_module(yaml: &str) -> Result<ModuleFile> {
    serde_yaml_ng::from_str(yaml).map_err(|e| KilnError::Parse(format!("YAML parse error: {}", e)))
}

/// Validate a parsed module file. Returns a list of errors (empty = valid).
pub fn validate_module(file: &ModuleFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !is_valid_id(&file.module) {
        errors.push(ValidationError {
            message: format!("module name '{}' is not an identifier", file.module),
        });
    }

    if file.contracts.is_empty() {
        errors.push(ValidationError {
            message: format!("module '{}' declares no contracts", file.module),
        });
    }

    for (id, decl) in &file.contracts {
        if !is_valid_id(id) {
            errors.push(ValidationError {
                message: format!("contract id '{}' is not an identifier", id),
            });
        }

        if decl.contract.trim().is_empty() {
            errors.push(ValidationError {
                message: format!("contract '{}' has no contract name", id),
            });
        }

        let references = decl
            .args
            .iter()
            .filter_map(ArgValue::referenced)
            .chain(decl.after.iter().map(String::as_str));
        for dep in references {
            if dep == id.as_str() {
                errors.push(ValidationError {
                    message: format!("contract '{}' depends on itself", id),
                });
            } else if !file.contracts.contains_key(dep) {
                errors.push(ValidationError {
                    message: format!("contract '{}' references unknown contract '{}'", id, dep),
                });
            }
        }
    }

    if let Some(outputs) = &file.outputs {
        for (name, id) in outputs {
            if !file.contracts.contains_key(id) {
                errors.push(ValidationError {
                    message: format!("output '{}' binds unknown contract '{}'", name, id),
                });
            }
        }
    }

    errors
}

impl ModuleFile {
    /// Convert into a module, applying the default output bindings.
    pub fn into_module(self) -> Result<Module> {
        let outputs = match self.outputs {
            Some(outputs) => outputs,
            None => self
                .contracts
                .keys()
                .map(|id| (id.clone(), id.clone()))
                .collect(),
        };
        let descriptors = self
            .contracts
            .into_iter()
            .map(|(id, decl)| Descriptor {
                id,
                kind: decl.contract,
                args: decl.args,
                after: decl.after,
            })
            .collect();
        module_from_parts(&self.module, descriptors, outputs)
    }
}

/// Parse, validate and convert a module file in one step.
pub fn load_module(path: &Path) -> Result<Module> {
    let file = parse_module_file(path)?;
    let errors = validate_module(&file);
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(KilnError::Parse(format!("{}: {}", path.display(), joined)));
    }
    file.into_module()
}
