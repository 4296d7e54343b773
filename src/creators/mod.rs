//! KN-008: Creators — the collaborators that materialize descriptors.
//!
//! The engine never talks to a chain itself. A [`Creator`] receives the
//! target environment, the descriptor kind and its evaluated arguments, and
//! returns an opaque result (a contract address).

pub mod command;
pub mod simulated;

pub use command::CommandCreator;
pub use simulated::SimulatedCreator;

use crate::core::config::TargetEnvironment;
use crate::core::error::CreationError;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Materializes one descriptor against a target.
pub trait Creator {
    /// Create the resource and return its result.
    fn create(
        &mut self,
        target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<String, CreationError>;

    /// Report the result of an earlier creation that was interrupted before
    /// it could be journaled. `Ok(None)` means nothing was found.
    fn verify(
        &mut self,
        _target: &TargetEnvironment,
        _kind: &str,
        _args: &[Value],
    ) -> Result<Option<String>, CreationError> {
        Ok(None)
    }
}

impl<F> Creator for F
where
    F: FnMut(&str, &[Value]) -> Result<String, CreationError>,
{
    fn create(
        &mut self,
        _target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<String, CreationError> {
        self(kind, args)
    }
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex"))
}

/// Check that a string is a 20-byte hex address.
pub fn is_address(s: &str) -> bool {
    address_pattern().is_match(s)
}
