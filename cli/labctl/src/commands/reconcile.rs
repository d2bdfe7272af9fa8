//! Converge running environments with the roster.

use anyhow::Result;
use clap::Args;
use lab_reconcile::{DiffOptions, Plan};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_info, print_output, print_warning, OutputFormat};

use super::{describe_conflict, CommandContext};

/// Create missing tenants, remove orphans and recreate drifted ones.
#[derive(Debug, Args)]
pub struct ReconcileCommand {
    /// Leave environments that are not in the roster running.
    #[arg(long)]
    keep_orphans: bool,

    /// Also recreate tenants with stopped or missing containers.
    #[arg(long)]
    repair: bool,

    /// Print the plan without executing it or saving the roster.
    #[arg(long)]
    dry_run: bool,
}

/// Planned actions for one tenant.
#[derive(Debug, Serialize, Tabled)]
struct PlanRow {
    #[tabled(rename = "Tenant")]
    tenant: String,

    #[tabled(rename = "Actions", display = "display_actions")]
    actions: Vec<String>,
}

fn display_actions(actions: &[String]) -> String {
    actions.join("; ")
}

fn plan_rows(plan: &Plan) -> Vec<PlanRow> {
    plan.groups
        .iter()
        .map(|group| PlanRow {
            tenant: group.tenant_id.to_string(),
            actions: group.actions.iter().map(ToString::to_string).collect(),
        })
        .collect()
}

impl ReconcileCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let options = DiffOptions {
            remove_orphans: !self.keep_orphans,
            repair_degraded: self.repair,
        };

        let roster = ctx.load_roster()?;
        let engine = ctx.engine().await;

        if self.dry_run {
            let (prepared, plan) = engine.preview(&roster, &options).await?;
            print_output(&plan_rows(&plan), ctx.format);
            if ctx.format == OutputFormat::Table {
                let summary = plan.summary();
                print_info(&format!(
                    "{} create(s), {} removal(s), {} reallocation(s), {} unchanged",
                    summary.creates, summary.removes, summary.reallocations, summary.unchanged
                ));
                for conflict in &prepared.conflicts {
                    print_warning(&describe_conflict(conflict));
                }
            }
            return Ok(());
        }

        let mode = ctx.mode(roster.len())?;
        let batch = engine
            .reconcile(&roster, &options, &mode, ctx.cancel())
            .await?;
        ctx.finish_batch(&batch)
    }
}
