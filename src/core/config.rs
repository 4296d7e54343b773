//! KN-010: Toolchain configuration — compiler, strategy, networks, deployer.
//!
//! `kiln.toml` declares networks whose URLs and accounts may contain
//! `{{vars.NAME}}` templates. Secrets are never read from ambient state by the
//! engine: callers build a [`Vars`] (usually from `KILN_VAR_*` environment
//! variables) and resolve one network into an explicit [`TargetEnvironment`].

use super::error::{KilnError, Result};
use super::parser::ValidationError;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Environment variable prefix for template variables.
pub const VAR_PREFIX: &str = "KILN_VAR_";

/// Root of `kiln.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub compiler: CompilerSettings,

    #[serde(default)]
    pub strategy: Strategy,

    /// Named networks (order-preserving)
    #[serde(default)]
    pub networks: IndexMap<String, NetworkConfig>,

    #[serde(default)]
    pub deployer: DeployerConfig,
}

/// Compiler settings handed to the deploy command; kiln never compiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSettings {
    #[serde(default = "default_compiler_version")]
    pub version: String,

    #[serde(default)]
    pub optimizer: Optimizer,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: default_compiler_version(),
            optimizer: Optimizer::default(),
        }
    }
}

fn default_compiler_version() -> String {
    "0.8.26".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Optimizer {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_runs")]
    pub runs: u32,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            enabled: false,
            runs: default_runs(),
        }
    }
}

fn default_runs() -> u32 {
    200
}

/// How contract addresses are chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// The deployer's nonce decides the address.
    #[default]
    Basic,
    /// Deterministic CREATE2 deployment with a fixed salt.
    Create2 { salt: String },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Create2 { .. } => "create2",
        }
    }

    pub fn salt(&self) -> Option<&str> {
        match self {
            Self::Basic => None,
            Self::Create2 { salt } => Some(salt),
        }
    }
}

/// One network entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// RPC endpoint (templatable)
    pub url: String,

    pub chain_id: u64,

    /// Deployer private keys (templatable, secret)
    #[serde(default)]
    pub accounts: Vec<String>,

    /// Block-explorer API key (templatable, secret)
    #[serde(default)]
    pub explorer_api_key: Option<String>,
}

/// External deploy command settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployerConfig {
    /// Shell command that materializes one descriptor
    #[serde(default)]
    pub command: Option<String>,

    /// Shell command that reports an existing deployment, if any
    #[serde(default)]
    pub verify_command: Option<String>,
}

// ============================================================================
// Vars and templates
// ============================================================================

/// Template variables, usually secrets.
#[derive(Clone, Default)]
pub struct Vars {
    values: HashMap<String, String>,
}

impl fmt::Debug for Vars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Vars").field("names", &names).finish()
    }
}

impl Vars {
    /// Collect `KILN_VAR_<NAME>` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Collect prefixed variables from arbitrary key/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = pairs
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(VAR_PREFIX).map(|name| (name.to_string(), v)))
            .collect();
        Self { values }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Resolve every `{{vars.NAME}}` in a string.
pub fn resolve_template(template: &str, vars: &Vars) -> Result<String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| KilnError::Config(format!("unclosed template at position {}", open)))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = match key.strip_prefix("vars.") {
            Some(name) => vars
                .get(name)
                .ok_or_else(|| {
                    KilnError::Config(format!(
                        "unknown var: {} (set {}{})",
                        name, VAR_PREFIX, name
                    ))
                })?
                .to_string(),
            None => {
                return Err(KilnError::Config(format!(
                    "unknown template variable: {}",
                    key
                )))
            }
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

// ============================================================================
// Target environment
// ============================================================================

/// Everything a creator needs to reach one network, resolved and explicit.
#[derive(Clone)]
pub struct TargetEnvironment {
    pub network: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub accounts: Vec<String>,
    pub explorer_api_key: Option<String>,
    pub strategy: Strategy,
    pub compiler: CompilerSettings,
}

impl fmt::Debug for TargetEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetEnvironment")
            .field("network", &self.network)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &redact_url(&self.rpc_url))
            .field("accounts", &format!("<{} redacted>", self.accounts.len()))
            .field(
                "explorer_api_key",
                &self.explorer_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("strategy", &self.strategy.name())
            .field("compiler", &self.compiler.version)
            .finish()
    }
}

impl TargetEnvironment {
    /// A target with no credentials, for offline rehearsals and tests.
    pub fn local(network: &str, chain_id: u64) -> Self {
        Self {
            network: network.to_string(),
            chain_id,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            accounts: Vec::new(),
            explorer_api_key: None,
            strategy: Strategy::Basic,
            compiler: CompilerSettings::default(),
        }
    }
}

/// Keep scheme and host only; RPC paths commonly embed API keys.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(u) => format!("{}://{}/…", u.scheme(), u.host_str().unwrap_or("?")),
        Err(_) => "<invalid url>".to_string(),
    }
}

impl KilnConfig {
    /// Resolve a named network into a target environment.
    pub fn target(&self, network: &str, vars: &Vars) -> Result<TargetEnvironment> {
        let net = self.networks.get(network).ok_or_else(|| {
            KilnError::Config(format!(
                "unknown network '{}' (known: {})",
                network,
                self.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;

        let rpc_url = resolve_template(&net.url, vars)?;
        if !validate_url(&rpc_url) {
            return Err(KilnError::Config(format!(
                "network '{}' has an invalid RPC URL",
                network
            )));
        }
        let accounts = net
            .accounts
            .iter()
            .map(|a| resolve_template(a, vars))
            .collect::<Result<Vec<_>>>()?;
        let explorer_api_key = net
            .explorer_api_key
            .as_deref()
            .map(|k| resolve_template(k, vars))
            .transpose()?;

        Ok(TargetEnvironment {
            network: network.to_string(),
            chain_id: net.chain_id,
            rpc_url,
            accounts,
            explorer_api_key,
            strategy: self.strategy.clone(),
            compiler: self.compiler.clone(),
        })
    }

    /// Chain id of a network without resolving any secrets.
    pub fn chain_id(&self, network: &str) -> Result<u64> {
        self.networks
            .get(network)
            .map(|n| n.chain_id)
            .ok_or_else(|| KilnError::Config(format!("unknown network '{}'", network)))
    }
}

/// Validate that a URL is well-formed and uses HTTP or HTTPS.
pub fn validate_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            (scheme == "http" || scheme == "https") && parsed.host().is_some()
        }
        Err(_) => false,
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

/// Parse `kiln.toml` from disk.
pub fn load_config(path: &Path) -> Result<KilnConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| KilnError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse `kiln.toml` from a string.
pub fn parse_config(content: &str) -> Result<KilnConfig> {
    toml::from_str(content).map_err(|e| KilnError::Config(format!("TOML parse error: {}", e)))
}

fn salt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("static regex"))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
/// Templated URLs are checked for shape only; their vars are not required.
pub fn validate_config(config: &KilnConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Strategy::Create2 { salt } = &config.strategy {
        if !salt_pattern().is_match(salt) {
            errors.push(ValidationError {
                message: "create2 salt must be 0x followed by 64 hex digits".to_string(),
            });
        }
    }

    for (name, net) in &config.networks {
        if net.chain_id == 0 {
            errors.push(ValidationError {
                message: format!("network '{}' has chain_id 0", name),
            });
        }
        if !net.url.contains("{{") && !validate_url(&net.url) {
            errors.push(ValidationError {
                message: format!("network '{}' has an invalid url '{}'", name, net.url),
            });
        }
    }

    let mut seen: HashMap<u64, &str> = HashMap::new();
    for (name, net) in &config.networks {
        if let Some(other) = seen.insert(net.chain_id, name) {
            errors.push(ValidationError {
                message: format!(
                    "networks '{}' and '{}' share chain_id {} and would share a journal",
                    other, name, net.chain_id
                ),
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[compiler]
version = "0.8.26"
optimizer = { enabled = true, runs = 1200 }

[strategy]
kind = "create2"
salt = "0x0100100111110000100010000000000000000000000000000011011011000000"

[networks.polygon]
url = "https://polygon-mainnet.g.alchemy.com/v2/{{vars.ALCHEMY_API_KEY}}"
chain_id = 137
accounts = ["{{vars.PRIVATE_KEY}}"]
explorer_api_key = "{{vars.ETHERSCAN_API_KEY}}"

[networks.amoy]
url = "https://rpc-amoy.polygon.technology"
chain_id = 80002
accounts = ["{{vars.PRIVATE_KEY}}"]
"#;

    fn vars() -> Vars {
        Vars::from_pairs([
            ("KILN_VAR_ALCHEMY_API_KEY".to_string(), "alch".to_string()),
            ("KILN_VAR_PRIVATE_KEY".to_string(), "0xsecret".to_string()),
            ("KILN_VAR_ETHERSCAN_API_KEY".to_string(), "scan".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ])
    }

    #[test]
    fn test_kn010_parse_sample() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.compiler.version, "0.8.26");
        assert!(config.compiler.optimizer.enabled);
        assert_eq!(config.compiler.optimizer.runs, 1200);
        assert_eq!(config.strategy.name(), "create2");
        assert_eq!(config.networks.len(), 2);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_kn010_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.strategy, Strategy::Basic);
        assert_eq!(config.compiler.optimizer.runs, 200);
        assert!(config.networks.is_empty());
        assert!(config.deployer.command.is_none());
    }

    #[test]
    fn test_kn010_vars_prefix_filter() {
        let v = vars();
        assert_eq!(v.get("PRIVATE_KEY"), Some("0xsecret"));
        assert_eq!(v.get("HOME"), None);
    }

    #[test]
    fn test_kn010_resolve_template() {
        let v = vars();
        assert_eq!(
            resolve_template("a/{{ vars.ALCHEMY_API_KEY }}/b", &v).unwrap(),
            "a/alch/b"
        );
        assert!(resolve_template("{{vars.MISSING}}", &v)
            .unwrap_err()
            .to_string()
            .contains("KILN_VAR_MISSING"));
        assert!(resolve_template("{{params.x}}", &v).is_err());
        assert!(resolve_template("{{vars.X", &v).is_err());
    }

    #[test]
    fn test_kn010_target_resolution() {
        let config = parse_config(SAMPLE).unwrap();
        let target = config.target("polygon", &vars()).unwrap();
        assert_eq!(target.chain_id, 137);
        assert_eq!(target.rpc_url, "https://polygon-mainnet.g.alchemy.com/v2/alch");
        assert_eq!(target.accounts, vec!["0xsecret"]);
        assert_eq!(target.explorer_api_key.as_deref(), Some("scan"));
        assert_eq!(target.strategy.salt().map(str::len), Some(66));
    }

    #[test]
    fn test_kn010_target_debug_redacts_secrets() {
        let config = parse_config(SAMPLE).unwrap();
        let target = config.target("polygon", &vars()).unwrap();
        let debug = format!("{:?}", target);
        assert!(!debug.contains("0xsecret"));
        assert!(!debug.contains("alch\""));
        assert!(!debug.contains("scan"));
        assert!(debug.contains("polygon-mainnet.g.alchemy.com"));
    }

    #[test]
    fn test_kn010_target_missing_var_only_for_selected_network() {
        let config = parse_config(SAMPLE).unwrap();
        let mut only_key = Vars::default();
        only_key.set("PRIVATE_KEY", "0xk");
        assert!(config.target("amoy", &only_key).is_ok());
        assert!(config.target("polygon", &only_key).is_err());
    }

    #[test]
    fn test_kn010_unknown_network() {
        let config = parse_config(SAMPLE).unwrap();
        let err = config.target("mainnet", &vars()).unwrap_err();
        assert!(err.to_string().contains("polygon, amoy"));
        assert_eq!(config.chain_id("amoy").unwrap(), 80002);
    }

    #[test]
    fn test_kn010_validate_bad_salt_url_and_chain() {
        let config = parse_config(
            r#"
[strategy]
kind = "create2"
salt = "0x1234"

[networks.a]
url = "ftp://example.com"
chain_id = 0

[networks.b]
url = "http://localhost:8545"
chain_id = 0
"#,
        )
        .unwrap();
        let errors = validate_config(&config);
        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("salt")));
        assert!(messages.iter().any(|m| m.contains("invalid url")));
        assert!(messages.iter().any(|m| m.contains("chain_id 0")));
        assert!(messages.iter().any(|m| m.contains("share chain_id")));
    }

    #[test]
    fn test_kn010_salt_pattern() {
        assert!(salt_pattern().is_match(&format!("0x{}", "aB".repeat(32))));
        assert!(!salt_pattern().is_match(&format!("0x{}", "0".repeat(63))));
        assert!(!salt_pattern().is_match(&format!("0x{}g", "0".repeat(63))));
        assert!(std::ptr::eq(salt_pattern(), salt_pattern()));
    }

    #[test]
    fn test_kn010_validate_url() {
        assert!(validate_url("https://rpc-amoy.polygon.technology"));
        assert!(validate_url("http://127.0.0.1:8545"));
        assert!(!validate_url("not-a-url"));
        assert!(!validate_url("ws://node:8546"));
    }

    #[test]
    fn test_kn010_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.chain_id("polygon").unwrap(), 137);
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
