//! Interactive approval for parallel runs.

use std::io::{self, BufRead, IsTerminal, Write};

use colored::Colorize;
use lab_agent::ConfirmParallel;

/// Asks on the controlling terminal.
pub struct TerminalPrompt;

impl TerminalPrompt {
    /// Returns true if a prompt can be shown.
    pub fn available() -> bool {
        io::stdin().is_terminal()
    }
}

impl ConfirmParallel for TerminalPrompt {
    fn confirm(&self, tenants: usize, workers: usize) -> bool {
        eprint!("{} {} ", "Confirm:".cyan().bold(), question(tenants, workers));
        let _ = io::stderr().flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => parse_answer(&line),
            Err(_) => false,
        }
    }
}

/// Names the roster size, not a group count: orphans may add removals.
fn question(tenants: usize, workers: usize) -> String {
    format!("use {workers} parallel worker(s) on a roster of {tenants} tenant(s)? [y/N]")
}

/// Anything but an explicit yes declines.
fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
