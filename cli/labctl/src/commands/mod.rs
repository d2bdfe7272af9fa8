//! CLI commands.

mod add;
mod allocate;
mod build;
mod capacity;
mod down;
mod exec;
mod list;
mod recreate;
mod reconcile;
mod remove;
mod status;
mod up;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use lab_agent::{
    BatchOutcome, ComposeSubstrate, Config, ExecutionMode, ExecutionReport, LabEngine,
    ParallelApproval,
};
use lab_allocator::Conflict;
use lab_roster::Roster;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::confirm::TerminalPrompt;
use crate::error::CliError;
use crate::output::{print_info, print_report, print_warning, OutputFormat};
use crate::roster_file;

/// labctl - Provision and reconcile per-tenant lab environments.
#[derive(Debug, Parser)]
#[command(name = "labctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Roster file (TOML).
    #[arg(long, global = true, env = "LAB_ROSTER", default_value = "roster.toml")]
    roster: PathBuf,

    /// Compose file describing one tenant environment.
    #[arg(long, global = true, env = "LAB_COMPOSE_FILE")]
    compose_file: Option<PathBuf>,

    /// Run tenants in parallel instead of one at a time.
    #[arg(long, global = true)]
    parallel: bool,

    /// Parallel worker count.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Approve parallel execution without prompting.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Never prefix docker with sudo.
    #[arg(long, global = true)]
    no_sudo: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring every roster tenant up.
    Up(up::UpCommand),

    /// Converge running environments with the roster.
    Reconcile(reconcile::ReconcileCommand),

    /// Tear environments down.
    Down(down::DownCommand),

    /// Tear one tenant down and bring it back up.
    Recreate(recreate::RecreateCommand),

    /// Add a tenant to the roster and bring it up.
    Add(add::AddCommand),

    /// Tear one tenant down.
    Remove(remove::RemoveCommand),

    /// Show one tenant's environment.
    Status(status::StatusCommand),

    /// List roster tenants and orphaned environments.
    List(list::ListCommand),

    /// Fill in ports, subnets and credentials without touching docker.
    Allocate(allocate::AllocateCommand),

    /// Open a shell in a tenant container.
    Exec(exec::ExecCommand),

    /// Build the lab images.
    Build(build::BuildCommand),

    /// Find how many tenants this host sustains.
    Capacity(capacity::CapacityCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Whether logs should be JSON.
    pub fn log_json(&self) -> bool {
        self.log_json
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let mut config = Config::from_env()?;
        if let Some(compose_file) = self.compose_file {
            config.compose_file = compose_file;
        }
        if let Some(workers) = self.workers {
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            config.workers = workers;
        }
        if self.no_sudo {
            config.use_sudo = Some(false);
        }

        let ctx = CommandContext {
            format: OutputFormat::parse(&self.format),
            roster_path: self.roster,
            config,
            parallel: self.parallel,
            assume_yes: self.yes,
            cancel: spawn_interrupt_handler(),
        };

        match self.command {
            Commands::Up(cmd) => cmd.run(ctx).await,
            Commands::Reconcile(cmd) => cmd.run(ctx).await,
            Commands::Down(cmd) => cmd.run(ctx).await,
            Commands::Recreate(cmd) => cmd.run(ctx).await,
            Commands::Add(cmd) => cmd.run(ctx).await,
            Commands::Remove(cmd) => cmd.run(ctx).await,
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::List(cmd) => cmd.run(ctx).await,
            Commands::Allocate(cmd) => cmd.run(ctx),
            Commands::Exec(cmd) => cmd.run(ctx).await,
            Commands::Build(cmd) => cmd.run(ctx).await,
            Commands::Capacity(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("labctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// First Ctrl-C stops dispatching new tenants; a second one exits.
fn spawn_interrupt_handler() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, waiting for in-flight tenants (Ctrl-C again to abort)");
        let _ = cancel_tx.send(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    cancel_rx
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub roster_path: PathBuf,
    pub config: Config,
    pub parallel: bool,
    pub assume_yes: bool,
    cancel: watch::Receiver<bool>,
}

impl CommandContext {
    /// Load the roster, failing if the file is missing.
    pub fn load_roster(&self) -> Result<Roster> {
        roster_file::load(&self.roster_path)
    }

    /// Load the roster, or an empty one if the file is missing.
    pub fn load_roster_or_empty(&self) -> Result<Roster> {
        roster_file::load_or_empty(&self.roster_path)
    }

    /// Write the roster back.
    pub fn save_roster(&self, roster: &Roster) -> Result<()> {
        roster_file::save(&self.roster_path, roster)?;
        info!(path = %self.roster_path.display(), tenants = roster.len(), "Roster saved");
        Ok(())
    }

    /// Cancellation signal for long-running batches.
    pub fn cancel(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// Compose adapter, probing for sudo unless configured.
    pub async fn compose(&self) -> ComposeSubstrate {
        let use_sudo = match self.config.use_sudo {
            Some(use_sudo) => use_sudo,
            None => {
                let detected = ComposeSubstrate::detect_sudo().await;
                if detected {
                    info!("docker is not reachable directly, using sudo");
                }
                detected
            }
        };
        ComposeSubstrate::from_config(&self.config, use_sudo)
    }

    /// Engine over the compose adapter.
    pub async fn engine(&self) -> LabEngine {
        LabEngine::new(Arc::new(self.compose().await), &self.config)
    }

    /// Execution mode for a run over a roster of `tenants`.
    ///
    /// Parallel runs need `--yes` or an interactive confirmation.
    pub fn mode(&self, tenants: usize) -> Result<ExecutionMode> {
        if !self.parallel {
            return Ok(ExecutionMode::Sequential);
        }

        let workers = self.config.workers;
        if self.assume_yes {
            return Ok(ExecutionMode::parallel(workers, ParallelApproval::assume_yes()));
        }
        if !TerminalPrompt::available() {
            return Err(CliError::NeedsConfirmation.into());
        }

        match ParallelApproval::confirm(&TerminalPrompt, tenants, workers) {
            Some(approval) => Ok(ExecutionMode::parallel(workers, approval)),
            None => Err(CliError::ParallelDeclined.into()),
        }
    }

    /// Persist roster changes, print the report, and fail if any tenant did.
    pub fn finish_batch(&self, batch: &BatchOutcome) -> Result<()> {
        if batch.roster_changed() {
            self.save_roster(&batch.roster)?;
            if self.format == OutputFormat::Table {
                print_info(&format!(
                    "Roster updated: {} allocation change(s), {} new credential(s)",
                    batch.changes.len(),
                    batch.issued.len()
                ));
            }
        }
        if self.format == OutputFormat::Table {
            for conflict in &batch.conflicts {
                print_warning(&describe_conflict(conflict));
            }
        }

        self.finish_report(&batch.report)
    }

    /// Print a report and fail if any tenant did.
    pub fn finish_report(&self, report: &ExecutionReport) -> Result<()> {
        print_report(report, self.format);
        if report.is_success() {
            Ok(())
        } else {
            let counts = report.counts();
            Err(CliError::TenantsFailed {
                failed: counts.failed,
                skipped: counts.skipped,
            }
            .into())
        }
    }
}

/// One line describing a repaired conflict.
pub fn describe_conflict(conflict: &Conflict) -> String {
    let tenants: Vec<String> = conflict.tenants.iter().map(ToString::to_string).collect();
    format!(
        "{} {} was shared by {}; every holder was reassigned",
        conflict.field,
        conflict.value,
        tenants.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn context(parallel: bool, assume_yes: bool) -> CommandContext {
        CommandContext {
            format: OutputFormat::Table,
            roster_path: PathBuf::from("roster.toml"),
            config: Config {
                workers: 3,
                ..Config::default()
            },
            parallel,
            assume_yes,
            cancel: watch::channel(false).1,
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "labctl", "up", "--parallel", "-y", "--workers", "3", "--roster", "class.toml",
        ])
        .unwrap();

        assert!(cli.parallel);
        assert!(cli.yes);
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.roster, PathBuf::from("class.toml"));
        assert!(matches!(cli.command, Commands::Up(_)));
    }

    #[test]
    fn malformed_tenant_id_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["labctl", "recreate", "Bad Id"]).is_err());
        assert!(Cli::try_parse_from(["labctl", "recreate", "student7"]).is_ok());
    }

    #[test]
    fn sequential_is_the_default_mode() {
        let mode = context(false, true).mode(10).unwrap();
        assert_eq!(mode, ExecutionMode::Sequential);
    }

    #[test]
    fn yes_approves_parallel_without_prompting() {
        let mode = context(true, true).mode(10).unwrap();
        assert_eq!(mode.label(), "parallel");
        assert_eq!(mode.workers(), 3);
    }
}
