//! Interactive shell in a tenant container.

use anyhow::{bail, Context, Result};
use clap::Args;
use lab_roster::TenantId;

use crate::error::CliError;

use super::CommandContext;

/// Short names accepted by `--container`.
const ALIASES: &[(&str, &str)] = &[
    ("kali", "kali-jump"),
    ("ubuntu1", "ubuntu-target1"),
    ("ubuntu2", "ubuntu-target2"),
];

/// Open `/bin/bash` in one of a tenant's containers.
#[derive(Debug, Args)]
pub struct ExecCommand {
    /// Tenant ID.
    tenant: TenantId,

    /// Container: kali, ubuntu1, ubuntu2, or a compose service name.
    #[arg(long, short = 'c', default_value = "kali")]
    container: String,
}

/// Map a container alias or service name to a compose service.
fn resolve_service<'a>(container: &'a str, roles: &'a [String]) -> Result<&'a str, CliError> {
    if let Some((_, service)) = ALIASES.iter().find(|(alias, _)| *alias == container) {
        return Ok(*service);
    }
    if roles.iter().any(|r| r == container) {
        return Ok(container);
    }
    Err(CliError::UnknownContainer(container.to_string()))
}

impl ExecCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let service = resolve_service(&self.container, &ctx.config.roles)?;
        let compose = ctx.compose().await;

        let command = compose.exec_command(&self.tenant, service);
        let status = tokio::process::Command::from(command)
            .status()
            .await
            .context("Failed to start docker exec")?;

        if !status.success() {
            bail!("Shell in {} exited with {}", self.tenant, status);
        }
        Ok(())
    }
}
