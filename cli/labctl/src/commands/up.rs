//! Provision every roster tenant.

use anyhow::Result;
use clap::Args;

use super::CommandContext;

/// Bring every roster tenant up.
///
/// Tenants already running with their allocation are left alone; other
/// environments on the host are not touched.
#[derive(Debug, Args)]
pub struct UpCommand {}

impl UpCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let roster = ctx.load_roster()?;
        let mode = ctx.mode(roster.len())?;
        let engine = ctx.engine().await;

        let batch = engine.provision_all(&roster, &mode, ctx.cancel()).await?;
        ctx.finish_batch(&batch)
    }
}
