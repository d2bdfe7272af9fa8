//! Show one tenant's environment.

use anyhow::Result;
use clap::Args;
use lab_roster::TenantId;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_single, OutputFormat};

use super::CommandContext;

/// Show desired and observed state of one tenant.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Tenant ID.
    tenant: TenantId,
}

#[derive(Debug, Serialize, Tabled)]
struct ContainerRow {
    #[tabled(rename = "Container")]
    role: String,

    #[tabled(rename = "State")]
    state: String,
}

fn display_port(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn display_subnet(subnet_id: Option<u8>) -> String {
    subnet_id
        .map(|s| format!("172.20.{}.0/24", s))
        .unwrap_or_else(|| "-".to_string())
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let roster = ctx.load_roster_or_empty()?;
        let engine = ctx.engine().await;
        let status = engine.status_one(&roster, &self.tenant).await?;

        if ctx.format == OutputFormat::Json {
            print_single(&status);
            return Ok(());
        }

        println!("Tenant:   {}", status.tenant_id);
        if let Some(name) = status.display_name.as_deref().filter(|n| !n.is_empty()) {
            println!("Name:     {}", name);
        }
        println!("State:    {}", status.state_label());
        println!(
            "Port:     {} (desired {})",
            display_port(status.observed.bound_port),
            display_port(status.desired.map(|a| a.port))
        );
        println!(
            "Subnet:   {} (desired {})",
            display_subnet(status.observed.subnet_id),
            display_subnet(status.desired.map(|a| a.subnet_id))
        );
        println!();

        let rows: Vec<ContainerRow> = status
            .observed
            .containers
            .iter()
            .map(|(role, state)| ContainerRow {
                role: role.clone(),
                state: state.to_string(),
            })
            .collect();
        print_output(&rows, ctx.format);
        Ok(())
    }
}
