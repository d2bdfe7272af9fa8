//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use lab_agent::EngineError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Roster file not found: {}", .0.display())]
    RosterNotFound(PathBuf),

    #[error("Parallel run declined")]
    ParallelDeclined,

    #[error("Parallel execution needs confirmation, but stdin is not a terminal")]
    NeedsConfirmation,

    #[error("Unknown container '{0}'")]
    UnknownContainer(String),

    #[error("{failed} tenant(s) failed, {skipped} skipped")]
    TenantsFailed { failed: usize, skipped: usize },
}

impl CliError {
    /// What the operator can do about it.
    fn hint(&self) -> &'static str {
        match self {
            CliError::RosterNotFound(_) => {
                "Hint: Pass --roster or set LAB_ROSTER to the roster file."
            }
            CliError::ParallelDeclined | CliError::NeedsConfirmation => {
                "Hint: Pass --yes to approve parallel execution up front."
            }
            CliError::UnknownContainer(_) => {
                "Hint: Use kali, ubuntu1 or ubuntu2, or a full service name."
            }
            CliError::TenantsFailed { .. } => {
                "Hint: Re-run the command; healthy tenants are left untouched."
            }
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    let message = err.to_string();
    eprintln!("{} {}", "Error:".red().bold(), message);

    // Sources already folded into the message are not repeated.
    for cause in err.chain().skip(1) {
        let cause = cause.to_string();
        if !message.contains(&cause) {
            eprintln!("  caused by: {}", cause);
        }
    }

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        eprintln!("\n{}", cli_err.hint().yellow());
        return;
    }

    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        if engine_err.is_validation() {
            eprintln!(
                "\n{}",
                "Hint: Fix the roster file; nothing was changed.".yellow()
            );
        } else if let EngineError::UnknownTenant(_) = engine_err {
            eprintln!(
                "\n{}",
                "Hint: Run `labctl list` to see known tenants.".yellow()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_errors_keep_their_identity_through_anyhow() {
        let err = anyhow::Error::from(CliError::TenantsFailed {
            failed: 2,
            skipped: 1,
        });

        assert_eq!(err.to_string(), "2 tenant(s) failed, 1 skipped");
        let cli_err = err.downcast_ref::<CliError>().unwrap();
        assert!(cli_err.hint().starts_with("Hint: Re-run"));
    }

    #[test]
    fn every_cli_error_has_a_hint() {
        let errors = [
            CliError::RosterNotFound(PathBuf::from("roster.toml")),
            CliError::ParallelDeclined,
            CliError::NeedsConfirmation,
            CliError::UnknownContainer("db".to_string()),
            CliError::TenantsFailed {
                failed: 1,
                skipped: 0,
            },
        ];

        for err in errors {
            assert!(err.hint().starts_with("Hint: "), "{err}");
        }
    }
}
