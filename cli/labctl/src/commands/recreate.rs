//! Rebuild one tenant.

use anyhow::Result;
use clap::Args;
use lab_roster::TenantId;

use super::CommandContext;

/// Tear one roster tenant down and bring it back up with its allocation.
#[derive(Debug, Args)]
pub struct RecreateCommand {
    /// Tenant ID.
    tenant: TenantId,
}

impl RecreateCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let roster = ctx.load_roster()?;
        let engine = ctx.engine().await;

        let batch = engine.recreate_one(&roster, &self.tenant, ctx.cancel()).await?;
        ctx.finish_batch(&batch)
    }
}
