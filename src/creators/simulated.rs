//! KN-008: Simulated creator — offline rehearsals with deterministic addresses.
//!
//! With the `create2` strategy an address depends only on the salt, chain,
//! kind and arguments, so a rehearsal predicts the real CREATE2 address
//! space. With `basic` a per-creator nonce is mixed in, the way a deployer
//! account's nonce advances.

use super::Creator;
use crate::core::config::{Strategy, TargetEnvironment};
use crate::core::error::CreationError;
use crate::tripwire::hasher;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Default)]
pub struct SimulatedCreator {
    nonce: u64,
}

impl SimulatedCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address that would be produced for this request.
    pub fn predict(
        &self,
        target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<String, CreationError> {
        let args = serde_json::to_string(args)
            .map_err(|e| CreationError::new(format!("JSON serialize error: {}", e)))?;
        let chain = target.chain_id.to_string();
        let seed = match &target.strategy {
            Strategy::Create2 { salt } => salt.clone(),
            Strategy::Basic => format!("nonce:{}", self.nonce),
        };
        let digest = hasher::composite_digest(&[&seed, &chain, kind, &args]);
        let hex = digest.to_hex();
        Ok(format!("0x{}", &hex[..40]))
    }
}

impl Creator for SimulatedCreator {
    fn create(
        &mut self,
        target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<String, CreationError> {
        let address = self.predict(target, kind, args)?;
        self.nonce += 1;
        info!(kind, %address, network = %target.network, "simulated deployment");
        Ok(address)
    }
}
