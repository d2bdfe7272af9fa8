//! Configuration for the lab agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Container roles every lab environment runs.
pub const DEFAULT_ROLES: [&str; 3] = ["kali-jump", "ubuntu-target1", "ubuntu-target2"];

/// Lab agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Compose file describing one lab environment.
    pub compose_file: PathBuf,

    /// Prefix for compose project and network names.
    pub project_prefix: String,

    /// Run docker through sudo. `None` means detect at startup.
    pub use_sudo: Option<bool>,

    /// Worker limit for parallel execution.
    pub workers: usize,

    /// Timeout for a single substrate call.
    pub call_timeout: Duration,

    /// Timeout for a whole capacity cohort to come up.
    pub cohort_timeout: Duration,

    /// Container roles expected in every environment.
    pub roles: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compose_file: PathBuf::from("docker-compose.yml"),
            project_prefix: "cyber-lab-".to_string(),
            use_sudo: None,
            workers: 5,
            call_timeout: Duration::from_secs(600),
            cohort_timeout: Duration::from_secs(900),
            roles: DEFAULT_ROLES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let compose_file = lookup("LAB_COMPOSE_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.compose_file);

        let project_prefix = lookup("LAB_PROJECT_PREFIX").unwrap_or(defaults.project_prefix);

        let use_sudo = match lookup("LAB_USE_SUDO") {
            Some(raw) => parse_sudo(&raw).context("invalid LAB_USE_SUDO")?,
            None => defaults.use_sudo,
        };

        let workers = parsed(&lookup, "LAB_WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            bail!("LAB_WORKERS must be at least 1");
        }

        let call_timeout = parsed(&lookup, "LAB_CALL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);

        let cohort_timeout = parsed(&lookup, "LAB_COHORT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cohort_timeout);

        Ok(Self {
            compose_file,
            project_prefix,
            use_sudo,
            workers,
            call_timeout,
            cohort_timeout,
            roles: defaults.roles,
        })
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}

fn parse_sudo(raw: &str) -> Result<Option<bool>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => Ok(None),
        "1" | "true" | "yes" => Ok(Some(true)),
        "0" | "false" | "no" => Ok(Some(false)),
        other => bail!("expected true, false or auto, got {other:?}"),
    }
}
