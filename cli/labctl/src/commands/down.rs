//! Tear environments down.

use anyhow::Result;
use clap::Args;
use lab_agent::TeardownScope;

use super::CommandContext;

/// Tear down every roster tenant.
#[derive(Debug, Args)]
pub struct DownCommand {
    /// Also remove environments that are not in the roster.
    #[arg(long)]
    orphans: bool,
}

impl DownCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let (roster, scope) = if self.orphans {
            (ctx.load_roster_or_empty()?, TeardownScope::Everything)
        } else {
            (ctx.load_roster()?, TeardownScope::RosterOnly)
        };

        let mode = ctx.mode(roster.len())?;
        let engine = ctx.engine().await;

        let report = engine.teardown(&roster, scope, &mode, ctx.cancel()).await?;
        ctx.finish_report(&report)
    }
}
