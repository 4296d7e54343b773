//! KN-001: Core types — descriptors, modules, journal entries, plans, events.
//!
//! Descriptors and modules derive Serialize/Deserialize so they round-trip
//! through YAML module files; journal entries round-trip through both
//! journal backends.

use crate::tripwire::hasher;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Descriptors
// ============================================================================

/// Reference to another descriptor's future result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FutureRef {
    pub future: String,
}

/// A constructor argument, captured lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Result of another descriptor, substituted at execution time.
    Future(FutureRef),
    /// A concrete value passed through unchanged.
    Literal(serde_json::Value),
}

impl ArgValue {
    /// Reference a descriptor by id.
    pub fn future(id: impl Into<String>) -> Self {
        Self::Future(FutureRef { future: id.into() })
    }

    /// Wrap any JSON-convertible literal.
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// The referenced descriptor id, if this is a future.
    pub fn referenced(&self) -> Option<&str> {
        match self {
            Self::Future(r) => Some(r.future.as_str()),
            Self::Literal(_) => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::Literal(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::Literal(serde_json::Value::String(s))
    }
}

/// A named, lazy specification of one resource to construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique within its module
    pub id: String,

    /// External resource type (e.g. contract name)
    pub kind: String,

    /// Constructor arguments, in order
    #[serde(default)]
    pub args: Vec<ArgValue>,

    /// Explicit ordering edges that pass no value
    #[serde(default)]
    pub after: Vec<String>,
}

impl Descriptor {
    /// Every descriptor id this one must be created after.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for dep in self
            .args
            .iter()
            .filter_map(ArgValue::referenced)
            .chain(self.after.iter().map(String::as_str))
        {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        deps
    }

    /// BLAKE3 fingerprint of the declaration (kind, unevaluated args, after).
    pub fn fingerprint(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        let after = self.after.join(",");
        hasher::composite_hash(&[&self.kind, &args, &after])
    }
}

// ============================================================================
// Modules
// ============================================================================

/// A named collection of descriptors plus exposed output bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,

    /// Descriptors in declaration order
    pub descriptors: IndexMap<String, Descriptor>,

    /// Exposed name -> descriptor id
    pub outputs: IndexMap<String, String>,
}

impl Module {
    pub fn descriptor(&self, id: &str) -> Option<&Descriptor> {
        self.descriptors.get(id)
    }
}

/// Journal key for a descriptor in a module: `Module#id`.
pub fn entry_key(module: &str, descriptor: &str) -> String {
    format!("{}#{}", module, descriptor)
}

// ============================================================================
// Journal
// ============================================================================

/// Execution status of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl EntryStatus {
    /// Storage form used by the SQLite backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable record of one descriptor's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub module: String,
    pub descriptor: String,
    pub kind: String,

    /// Fingerprint of the declaration that produced this entry
    pub fingerprint: String,

    pub status: EntryStatus,

    /// Materialized result (e.g. contract address), set once Completed
    #[serde(default)]
    pub result: Option<String>,

    /// Last failure message
    #[serde(default)]
    pub error: Option<String>,

    /// Number of times the descriptor was moved to Pending
    pub attempts: u32,

    /// Compare-and-set token, bumped on every write
    pub revision: u64,

    pub updated_at: String,
}

impl JournalEntry {
    pub fn key(&self) -> String {
        entry_key(&self.module, &self.descriptor)
    }
}

// ============================================================================
// Plans
// ============================================================================

/// Ordered descriptor ids respecting dependency edges. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub module: String,
    pub order: Vec<String>,
}

/// What a run will do with a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Completed earlier; the recorded result is reused.
    Reuse { result: String },
    /// Never attempted.
    Create,
    /// Failed earlier; will be moved back to Pending.
    Retry,
    /// Left Pending by an interrupted run; verified, then re-created if needed.
    Recover,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse { .. } => write!(f, "REUSE"),
            Self::Create => write!(f, "CREATE"),
            Self::Retry => write!(f, "RETRY"),
            Self::Recover => write!(f, "RECOVER"),
        }
    }
}

/// A single planned step.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub descriptor: String,
    pub kind: String,
    pub action: PlanAction,
    pub description: String,
}

/// Full deployment plan for one module against one journal.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub module: String,
    pub steps: Vec<PlannedStep>,
    pub to_create: u32,
    pub to_retry: u32,
    pub to_recover: u32,
    pub reused: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        module: String,
        run_id: String,
        network: String,
        kiln_version: String,
    },
    DescriptorStarted {
        module: String,
        descriptor: String,
        kind: String,
        action: String,
    },
    DescriptorReused {
        module: String,
        descriptor: String,
        result: String,
    },
    DescriptorCompleted {
        module: String,
        descriptor: String,
        result: String,
        duration_seconds: f64,
    },
    DescriptorFailed {
        module: String,
        descriptor: String,
        error: String,
    },
    RunCompleted {
        module: String,
        run_id: String,
        created: u32,
        reused: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Execution result
// ============================================================================

/// Result of executing one module.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub module: String,

    /// Exposed output name -> materialized result
    pub outputs: IndexMap<String, String>,

    /// Every descriptor's result, in plan order
    pub results: IndexMap<String, String>,

    pub created: u32,
    pub reused: u32,
    pub total_duration: std::time::Duration,
}
