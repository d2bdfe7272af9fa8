//! List tenants and their state.

use anyhow::Result;
use clap::Args;
use lab_agent::TenantStatus;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{display_option, print_output, print_single, OutputFormat};

use super::CommandContext;

/// List roster tenants, then environments that are not in the roster.
#[derive(Debug, Args)]
pub struct ListCommand {}

#[derive(Debug, Serialize, Tabled)]
struct TenantRow {
    #[tabled(rename = "Tenant")]
    tenant: String,

    #[tabled(rename = "Name", display = "display_option")]
    name: Option<String>,

    #[tabled(rename = "Port", display = "display_option")]
    port: Option<String>,

    #[tabled(rename = "Subnet", display = "display_option")]
    subnet: Option<String>,

    #[tabled(rename = "Containers")]
    containers: String,

    #[tabled(rename = "State")]
    state: String,
}

impl From<&TenantStatus> for TenantRow {
    fn from(status: &TenantStatus) -> Self {
        // Orphans only have what the substrate reports.
        let port = status
            .desired
            .map(|a| a.port)
            .or(status.observed.bound_port);
        let subnet = status
            .desired
            .map(|a| a.subnet_id)
            .or(status.observed.subnet_id);

        Self {
            tenant: status.tenant_id.to_string(),
            name: status.display_name.clone().filter(|n| !n.is_empty()),
            port: port.map(|p| p.to_string()),
            subnet: subnet.map(|s| s.to_string()),
            containers: format!(
                "{}/{} running",
                status.observed.running_count(),
                status.observed.containers.len()
            ),
            state: status.state_label(),
        }
    }
}

impl ListCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let roster = ctx.load_roster_or_empty()?;
        let engine = ctx.engine().await;
        let statuses = engine.list_all(&roster).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&statuses),
            OutputFormat::Table => {
                let rows: Vec<TenantRow> = statuses.iter().map(TenantRow::from).collect();
                print_output(&rows, ctx.format);
            }
        }
        Ok(())
    }
}
