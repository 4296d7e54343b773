//! KN-008: Command creator — delegate deployment to the operator's tooling.
//!
//! The configured command runs through `bash -c`. The request is written to
//! stdin as one JSON line; the target environment (including secrets) is
//! passed as `KILN_*` environment variables and never appears on the command
//! line. The result is the last non-empty stdout line.

use super::{is_address, Creator};
use crate::core::config::TargetEnvironment;
use crate::core::error::CreationError;
use serde::Serialize;
use serde_json::Value;
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// Output from running a deploy command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stdout line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).rfind(|l| !l.is_empty())
    }
}

#[derive(Serialize)]
struct Request<'a> {
    action: &'a str,
    kind: &'a str,
    args: &'a [Value],
}

/// Runs external commands to create and verify deployments.
#[derive(Debug, Clone)]
pub struct CommandCreator {
    command: String,
    verify_command: Option<String>,
}

impl CommandCreator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            verify_command: None,
        }
    }

    pub fn with_verify(mut self, verify_command: impl Into<String>) -> Self {
        self.verify_command = Some(verify_command.into());
        self
    }

    fn run(
        &self,
        command: &str,
        target: &TargetEnvironment,
        request: &Request,
    ) -> Result<ExecOutput, CreationError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| CreationError::new(format!("JSON serialize error: {}", e)))?;

        debug!(kind = request.kind, action = request.action, network = %target.network, "running deploy command");

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .envs(target_env(target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CreationError::new(format!("failed to spawn bash: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore the request may exit before reading it
            match writeln!(stdin, "{}", payload) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(CreationError::new(format!("stdin write error: {}", e))),
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| CreationError::new(format!("wait error: {}", e)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl Creator for CommandCreator {
    fn create(
        &mut self,
        target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<String, CreationError> {
        let request = Request {
            action: "create",
            kind,
            args,
        };
        let out = self.run(&self.command, target, &request)?;
        if !out.success() {
            return Err(CreationError::new(format!(
                "exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        match out.last_line() {
            Some(line) if is_address(line) => Ok(line.to_string()),
            Some(line) => Err(CreationError::new(format!(
                "deploy command printed '{}', expected an address",
                line
            ))),
            None => Err(CreationError::new("deploy command printed no address")),
        }
    }

    fn verify(
        &mut self,
        target: &TargetEnvironment,
        kind: &str,
        args: &[Value],
    ) -> Result<Option<String>, CreationError> {
        let Some(command) = self.verify_command.as_deref() else {
            return Ok(None);
        };
        let request = Request {
            action: "verify",
            kind,
            args,
        };
        let out = self.run(command, target, &request)?;
        if !out.success() {
            return Err(CreationError::new(format!(
                "verify exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        match out.last_line() {
            None => Ok(None),
            Some(line) if is_address(line) => Ok(Some(line.to_string())),
            Some(line) => Err(CreationError::new(format!(
                "verify command printed '{}', expected an address or nothing",
                line
            ))),
        }
    }
}

/// Environment handed to deploy commands.
fn target_env(target: &TargetEnvironment) -> Vec<(String, String)> {
    let mut env = vec![
        ("KILN_NETWORK".to_string(), target.network.clone()),
        ("KILN_CHAIN_ID".to_string(), target.chain_id.to_string()),
        ("KILN_RPC_URL".to_string(), target.rpc_url.clone()),
        ("KILN_ACCOUNTS".to_string(), target.accounts.join(",")),
        ("KILN_STRATEGY".to_string(), target.strategy.name().to_string()),
        (
            "KILN_COMPILER_VERSION".to_string(),
            target.compiler.version.clone(),
        ),
        (
            "KILN_OPTIMIZER_ENABLED".to_string(),
            target.compiler.optimizer.enabled.to_string(),
        ),
        (
            "KILN_OPTIMIZER_RUNS".to_string(),
            target.compiler.optimizer.runs.to_string(),
        ),
    ];
    if let Some(salt) = target.strategy.salt() {
        env.push(("KILN_CREATE2_SALT".to_string(), salt.to_string()));
    }
    if let Some(key) = &target.explorer_api_key {
        env.push(("KILN_EXPLORER_API_KEY".to_string(), key.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Strategy;

    const ADDR: &str = "0x338b7Ed75478D995E0c44cB4BDEDf83a6f47F665";

    fn target() -> TargetEnvironment {
        let mut t = TargetEnvironment::local("amoy", 80002);
        t.accounts = vec!["0xkey".to_string()];
        t
    }

    #[test]
    fn test_kn008_command_create_reads_last_line() {
        let mut c = CommandCreator::new(format!("cat >/dev/null; echo compiling; echo {}", ADDR));
        assert_eq!(c.create(&target(), "Token", &[]).unwrap(), ADDR);
    }

    #[test]
    fn test_kn008_command_receives_request_on_stdin() {
        let script = format!(
            "read -r req; case \"$req\" in *'\"kind\":\"ExchangeToken\"'*'\"EXDC\"'*) echo {} ;; *) exit 3 ;; esac",
            ADDR
        );
        let mut c = CommandCreator::new(script);
        let args = vec![Value::String("Exchange".into()), Value::String("EXDC".into())];
        assert_eq!(c.create(&target(), "ExchangeToken", &args).unwrap(), ADDR);
    }

    #[test]
    fn test_kn008_command_receives_target_env() {
        let script = format!(
            "cat >/dev/null; [ \"$KILN_CHAIN_ID\" = 80002 ] && [ \"$KILN_ACCOUNTS\" = 0xkey ] && [ \"$KILN_CREATE2_SALT\" = 0xab ] && echo {}",
            ADDR
        );
        let mut t = target();
        t.strategy = Strategy::Create2 {
            salt: "0xab".to_string(),
        };
        let mut c = CommandCreator::new(script);
        assert_eq!(c.create(&t, "Token", &[]).unwrap(), ADDR);
    }

    #[test]
    fn test_kn008_command_failure_reports_stderr() {
        let mut c = CommandCreator::new("echo 'execution reverted' >&2; exit 1");
        let err = c.create(&target(), "Token", &[]).unwrap_err();
        assert!(err.message.contains("exit code 1"));
        assert!(err.message.contains("execution reverted"));
    }

    #[test]
    fn test_kn008_command_rejects_non_address() {
        let mut c = CommandCreator::new("echo done");
        let err = c.create(&target(), "Token", &[]).unwrap_err();
        assert!(err.message.contains("expected an address"));

        let mut silent = CommandCreator::new("true");
        assert!(silent.create(&target(), "Token", &[]).is_err());
    }

    #[test]
    fn test_kn008_verify_without_command_is_none() {
        let mut c = CommandCreator::new("exit 1");
        assert_eq!(c.verify(&target(), "Token", &[]).unwrap(), None);
    }

    #[test]
    fn test_kn008_verify_found_and_missing() {
        let mut found = CommandCreator::new("exit 1").with_verify(format!("echo {}", ADDR));
        assert_eq!(
            found.verify(&target(), "Token", &[]).unwrap().as_deref(),
            Some(ADDR)
        );

        let mut missing = CommandCreator::new("exit 1").with_verify("true");
        assert_eq!(missing.verify(&target(), "Token", &[]).unwrap(), None);

        let mut broken = CommandCreator::new("exit 1").with_verify("exit 2");
        assert!(broken.verify(&target(), "Token", &[]).is_err());
    }

    #[test]
    fn test_kn008_exec_output_last_line() {
        let out = ExecOutput {
            exit_code: 0,
            stdout: "a\n b \n\n".into(),
            stderr: String::new(),
        };
        assert!(out.success());
        assert_eq!(out.last_line(), Some("b"));
        let killed = ExecOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!killed.success());
        assert_eq!(killed.last_line(), None);
    }
}
