//! Capacity probing.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use lab_agent::capacity::{DEFAULT_MAX_PROBES, HARD_CEILING};
use lab_agent::{CapacityProber, CapacityReport, CapacitySearch, EngineCohort, ProbeRecord};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_single, print_success, print_warning, OutputFormat};

use super::CommandContext;

/// Binary-search the largest cohort this host brings up cleanly.
///
/// Cohorts use throwaway `captestNNN` tenants and are torn down after each
/// probe; roster tenants are not touched.
#[derive(Debug, Args)]
pub struct CapacityCommand {
    /// Cohort size known to succeed.
    #[arg(long, default_value_t = 0)]
    low: u32,

    /// Cohort size believed to fail.
    #[arg(long)]
    high: Option<u32>,

    /// Maximum number of cohorts to try.
    #[arg(long, default_value_t = DEFAULT_MAX_PROBES)]
    max_probes: u32,

    /// Seconds allowed for one cohort to come up.
    #[arg(long)]
    cohort_timeout: Option<u64>,
}

#[derive(Debug, Serialize, Tabled)]
struct ProbeRow {
    #[tabled(rename = "#")]
    index: usize,

    #[tabled(rename = "Cohort")]
    count: u32,

    #[tabled(rename = "Result")]
    result: &'static str,

    #[tabled(rename = "Duration")]
    duration: String,
}

impl ProbeRow {
    fn new(index: usize, probe: &ProbeRecord) -> Self {
        Self {
            index: index + 1,
            count: probe.count,
            result: if probe.success { "ok" } else { "failed" },
            duration: format!("{:.1}s", probe.duration_ms as f64 / 1000.0),
        }
    }
}

fn summarize(report: &CapacityReport) {
    match (report.converged, report.high) {
        (true, Some(high)) if high >= HARD_CEILING => print_success(&format!(
            "Host sustains {} tenants, the subnet limit",
            report.low
        )),
        (true, Some(high)) => print_success(&format!(
            "Host sustains {} tenants; {} failed",
            report.low, high
        )),
        (_, Some(high)) => print_warning(&format!(
            "Search stopped early: {} succeeded, {} failed",
            report.low, high
        )),
        (_, None) => print_warning(&format!(
            "Search stopped early: {} succeeded, no failure seen yet",
            report.low
        )),
    }
}

impl CapacityCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        if let Some(high) = self.high {
            if high <= self.low {
                bail!("--high must be greater than --low");
            }
        }

        let timeout = self
            .cohort_timeout
            .map(Duration::from_secs)
            .unwrap_or(ctx.config.cohort_timeout);
        let largest = self.high.unwrap_or(HARD_CEILING - 1);
        let mode = ctx.mode(largest as usize)?;

        let cohort = EngineCohort::new(ctx.engine().await, mode, timeout, ctx.cancel());
        let search = CapacitySearch::new(self.low, self.high).with_max_probes(self.max_probes);
        let report = CapacityProber::new(cohort).run(search, ctx.cancel()).await;

        if ctx.format == OutputFormat::Json {
            print_single(&report);
            return Ok(());
        }

        let rows: Vec<ProbeRow> = report
            .probes
            .iter()
            .enumerate()
            .map(|(i, p)| ProbeRow::new(i, p))
            .collect();
        print_output(&rows, ctx.format);
        summarize(&report);
        Ok(())
    }
}
