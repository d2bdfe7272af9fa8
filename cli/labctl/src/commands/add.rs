//! Add and provision one tenant.

use anyhow::Result;
use clap::Args;
use lab_roster::{TenantId, TenantRecord};

use crate::output::{print_info, OutputFormat};

use super::CommandContext;

/// Add a tenant to the roster (if new) and bring it up.
#[derive(Debug, Args)]
pub struct AddCommand {
    /// Tenant ID.
    tenant: TenantId,

    /// Display name for a new roster entry.
    #[arg(long)]
    name: Option<String>,
}

impl AddCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut roster = ctx.load_roster_or_empty()?;

        if roster.contains(&self.tenant) {
            if ctx.format == OutputFormat::Table {
                print_info(&format!("{} is already in the roster", self.tenant));
            }
        } else {
            let name = self.name.unwrap_or_default();
            roster.push(TenantRecord::new(self.tenant.clone(), name));
        }

        let engine = ctx.engine().await;
        let batch = engine.provision_one(&roster, &self.tenant, ctx.cancel()).await?;
        ctx.finish_batch(&batch)
    }
}
