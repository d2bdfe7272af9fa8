//! Offline allocation.

use anyhow::Result;
use clap::Args;
use lab_agent::credentials::{issue_missing, WordCredentials};
use lab_allocator::{allocate, AllocationChange};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    display_option, print_info, print_output, print_success, print_warning, OutputFormat,
};

use super::{describe_conflict, CommandContext};

/// Fill in missing ports, subnets and credentials and save the roster.
///
/// Running environments are not consulted, so values held by orphans are
/// not avoided; `up` and `reconcile` do that.
#[derive(Debug, Args)]
pub struct AllocateCommand {
    /// Show the changes without saving.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct ChangeRow {
    #[tabled(rename = "Tenant")]
    tenant: String,

    #[tabled(rename = "Field")]
    field: String,

    #[tabled(rename = "Old", display = "display_option")]
    old: Option<String>,

    #[tabled(rename = "New")]
    new: u32,
}

impl From<&AllocationChange> for ChangeRow {
    fn from(change: &AllocationChange) -> Self {
        Self {
            tenant: change.tenant_id.to_string(),
            field: change.field.to_string(),
            old: change.old.map(|v| v.to_string()),
            new: change.new,
        }
    }
}

impl AllocateCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let roster = ctx.load_roster()?;
        let outcome = allocate(&roster)?;

        let mut updated = outcome.roster;
        let issued = issue_missing(&mut updated, &WordCredentials);

        let rows: Vec<ChangeRow> = outcome.changes.iter().map(ChangeRow::from).collect();
        print_output(&rows, ctx.format);

        let changed = !outcome.changes.is_empty() || !issued.is_empty();
        if changed && !self.dry_run {
            ctx.save_roster(&updated)?;
        }

        if ctx.format == OutputFormat::Table {
            for conflict in &outcome.conflicts {
                print_warning(&describe_conflict(conflict));
            }
            if !issued.is_empty() {
                print_info(&format!("Issued {} new credential(s)", issued.len()));
            }
            match (changed, self.dry_run) {
                (false, _) => print_success("Roster already fully allocated"),
                (true, true) => print_info("Dry run, roster not saved"),
                (true, false) => {
                    print_success(&format!("Saved {}", ctx.roster_path.display()))
                }
            }
        }
        Ok(())
    }
}
