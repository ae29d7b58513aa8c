//! Local-exec provider.
//!
//! Runs profile-strategy shell commands and the name command on the local
//! host. Strategies carry the command in `provider_args.shell_command`; the
//! node address is exposed to the command as `SEXTANT_ADDRESS`. Commands
//! answer in the standard line-oriented profile-response format, and a
//! response starting with `ERROR:` is a provider failure.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use catalog::{parse_profile_response, ProfileStrategy};
use types::NodeTransport;

use crate::provider::{Provider, ProviderConnection, ProviderError};

pub struct ProcProvider {
    name_command: String,
}

impl ProcProvider {
    pub const REF: &'static str = "proc";

    pub fn new(name_command: impl Into<String>) -> Self {
        Self {
            name_command: name_command.into(),
        }
    }
}

#[async_trait]
impl Provider for ProcProvider {
    fn ref_id(&self) -> &'static str {
        Self::REF
    }

    async fn lookup_name(
        &self,
        address: &str,
        _connection: Option<&ProviderConnection>,
    ) -> Result<Option<String>, ProviderError> {
        let stdout = run_shell(&self.name_command, address).await?;
        let name = stdout.trim();
        debug!(%address, %name, "proc name lookup");
        Ok((!name.is_empty()).then(|| name.to_string()))
    }

    async fn profile(
        &self,
        address: &str,
        _connection: Option<&ProviderConnection>,
        strategy: &ProfileStrategy,
    ) -> Result<Vec<NodeTransport>, ProviderError> {
        let Some(command) = strategy
            .provider_args
            .get("shell_command")
            .and_then(|v| v.as_str())
        else {
            return Err(ProviderError::failed(format!(
                "strategy {:?} has no shell_command for the proc provider",
                strategy.name
            )));
        };
        let stdout = run_shell(command, address).await?;
        let stdout = stdout.trim();
        if stdout.starts_with("ERROR:") {
            return Err(ProviderError::failed(format!(
                "profile command reported: {}",
                stdout.replace('\n', "\t")
            )));
        }
        Ok(parse_profile_response(stdout, strategy)?)
    }
}

async fn run_shell(command: &str, address: &str) -> Result<String, ProviderError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("SEXTANT_ADDRESS", address)
        .output()
        .await?;
    if !output.status.success() {
        return Err(ProviderError::failed(format!(
            "command {command:?} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
