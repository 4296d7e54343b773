//! KN-002: Descriptor registry and the `build_module` declaration surface.
//!
//! A builder closure receives a [`ModuleBuilder`], defines descriptors, and
//! returns the module's output bindings. Arguments are captured as
//! expressions; references are only checked once the builder returns, so a
//! descriptor may name one declared after it.

use super::error::{KilnError, Result};
use super::types::{ArgValue, Descriptor, Module};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::OnceLock;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Check a descriptor or module identifier.
pub fn is_valid_id(id: &str) -> bool {
    id_pattern().is_match(id)
}

/// Handle to a descriptor's future result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureHandle {
    id: String,
}

impl FutureHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Use this future as a constructor argument.
    pub fn as_arg(&self) -> ArgValue {
        ArgValue::future(self.id.clone())
    }
}

impl From<&FutureHandle> for ArgValue {
    fn from(handle: &FutureHandle) -> Self {
        handle.as_arg()
    }
}

/// Registry handle passed to module builder closures.
#[derive(Debug)]
pub struct ModuleBuilder {
    module: String,
    descriptors: IndexMap<String, Descriptor>,
}

impl ModuleBuilder {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            descriptors: IndexMap::new(),
        }
    }

    /// Register a descriptor.
    pub fn define(
        &mut self,
        id: &str,
        kind: &str,
        args: Vec<ArgValue>,
    ) -> Result<FutureHandle> {
        self.define_after(id, kind, args, &[])
    }

    /// Register a descriptor that must also wait for `after` without using their results.
    pub fn define_after(
        &mut self,
        id: &str,
        kind: &str,
        args: Vec<ArgValue>,
        after: &[&FutureHandle],
    ) -> Result<FutureHandle> {
        if !is_valid_id(id) {
            return Err(KilnError::InvalidId(id.to_string()));
        }
        if self.descriptors.contains_key(id) {
            return Err(KilnError::DuplicateId {
                module: self.module.clone(),
                id: id.to_string(),
            });
        }
        self.descriptors.insert(
            id.to_string(),
            Descriptor {
                id: id.to_string(),
                kind: kind.to_string(),
                args,
                after: after.iter().map(|h| h.id.clone()).collect(),
            },
        );
        Ok(FutureHandle { id: id.to_string() })
    }

    /// Register a contract deployment whose id is the contract name.
    pub fn contract(&mut self, kind: &str, args: Vec<ArgValue>) -> Result<FutureHandle> {
        self.define(kind, kind, args)
    }

    fn insert(&mut self, descriptor: Descriptor) -> Result<()> {
        if !is_valid_id(&descriptor.id) {
            return Err(KilnError::InvalidId(descriptor.id));
        }
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(KilnError::DuplicateId {
                module: self.module.clone(),
                id: descriptor.id,
            });
        }
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }
}

/// Declare a module. The builder returns exposed name -> handle bindings.
pub fn build_module<F>(name: &str, builder: F) -> Result<Module>
where
    F: FnOnce(&mut ModuleBuilder) -> Result<IndexMap<String, FutureHandle>>,
{
    if !is_valid_id(name) {
        return Err(KilnError::InvalidId(name.to_string()));
    }
    let mut registry = ModuleBuilder::new(name);
    let bindings = builder(&mut registry)?;
    let outputs = bindings
        .into_iter()
        .map(|(exposed, handle)| (exposed, handle.id))
        .collect();
    finish(name, registry.descriptors, outputs)
}

/// Assemble a module from already-built descriptors (module files use this).
pub fn module_from_parts(
    name: &str,
    descriptors: Vec<Descriptor>,
    outputs: IndexMap<String, String>,
) -> Result<Module> {
    if !is_valid_id(name) {
        return Err(KilnError::InvalidId(name.to_string()));
    }
    let mut registry = ModuleBuilder::new(name);
    for d in descriptors {
        registry.insert(d)?;
    }
    finish(name, registry.descriptors, outputs)
}

fn finish(
    name: &str,
    descriptors: IndexMap<String, Descriptor>,
    outputs: IndexMap<String, String>,
) -> Result<Module> {
    for (id, descriptor) in &descriptors {
        for dep in descriptor.dependencies() {
            if !descriptors.contains_key(dep) {
                return Err(KilnError::UnknownReference {
                    from: id.clone(),
                    to: dep.to_string(),
                });
            }
        }
    }
    for (exposed, id) in &outputs {
        if !descriptors.contains_key(id) {
            return Err(KilnError::UnknownOutput {
                name: exposed.clone(),
                id: id.clone(),
            });
        }
    }
    Ok(Module {
        name: name.to_string(),
        descriptors,
        outputs,
    })
}
