//! Kiln — idempotent declarative provisioning for smart-contract deployments.
//!
//! Modules declare descriptors with lazy arguments. Kiln orders them by
//! dependency, journals every step, and resumes where the last run stopped.

pub mod cli;
pub mod core;
pub mod creators;
pub mod logging;
pub mod tripwire;

pub use crate::core::config::TargetEnvironment;
pub use crate::core::error::{CreationError, KilnError, ProvisioningError, Result};
pub use crate::core::executor::{execute, ExecuteConfig};
pub use crate::core::journal::Journal;
pub use crate::core::registry::{build_module, FutureHandle, ModuleBuilder};
pub use crate::core::types::{ArgValue, ExecutionReport, Module};
pub use crate::creators::Creator;
