//! Tear one tenant down.

use anyhow::Result;
use clap::Args;
use lab_roster::TenantId;

use crate::output::{print_info, OutputFormat};

use super::CommandContext;

/// Tear one environment down, in the roster or not.
#[derive(Debug, Args)]
pub struct RemoveCommand {
    /// Tenant ID.
    tenant: TenantId,

    /// Also drop the tenant from the roster.
    #[arg(long)]
    forget: bool,
}

impl RemoveCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let engine = ctx.engine().await;
        let report = engine.remove_one(&self.tenant, ctx.cancel()).await;

        if self.forget && report.is_success() {
            let mut roster = ctx.load_roster_or_empty()?;
            if roster.remove(&self.tenant).is_some() {
                ctx.save_roster(&roster)?;
                if ctx.format == OutputFormat::Table {
                    print_info(&format!("Removed {} from the roster", self.tenant));
                }
            }
        }

        ctx.finish_report(&report)
    }
}
