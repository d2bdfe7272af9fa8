//! docker compose substrate.
//!
//! Each tenant is one compose project named `<prefix><tenant_id>`, started
//! from a shared compose file. Per-tenant values reach the compose file as
//! environment variables:
//!
//! | Variable           | Value                      |
//! |--------------------|----------------------------|
//! | `STUDENT_ID`       | tenant ID                  |
//! | `STUDENT_NAME`     | display name               |
//! | `SSH_PORT`         | allocated host port        |
//! | `SUBNET_ID`        | third octet of 172.20.X.0  |
//! | `NETWORK_NAME`     | project name               |
//! | `STUDENT_PASSWORD` | secret, when issued        |

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use lab_reconcile::{ContainerState, ObservedTenant};
use lab_roster::TenantId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BringUp, Substrate, SubstrateError};
use crate::config::Config;

/// Container port of the SSH entry point inside each environment.
pub const SSH_CONTAINER_PORT: u16 = 22;

/// docker compose adapter.
#[derive(Debug, Clone)]
pub struct ComposeSubstrate {
    compose_file: PathBuf,
    project_prefix: String,
    use_sudo: bool,
    roles: Vec<String>,
}

impl ComposeSubstrate {
    /// Create an adapter for a compose file.
    pub fn new(compose_file: impl Into<PathBuf>, project_prefix: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            compose_file: compose_file.into(),
            project_prefix: project_prefix.into(),
            use_sudo,
            roles: Vec::new(),
        }
    }

    /// Create an adapter from agent configuration.
    pub fn from_config(config: &Config, use_sudo: bool) -> Self {
        Self::new(&config.compose_file, &config.project_prefix, use_sudo)
            .with_roles(config.roles.clone())
    }

    /// Set the container roles every environment is expected to have.
    ///
    /// Roles missing from `docker compose ps` are then reported as absent.
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Path of the compose file.
    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    /// Compose project name for a tenant.
    pub fn project_name(&self, tenant_id: &TenantId) -> String {
        format!("{}{}", self.project_prefix, tenant_id)
    }

    /// Network name for a tenant (same as the project name).
    pub fn network_name(&self, tenant_id: &TenantId) -> String {
        self.project_name(tenant_id)
    }

    /// Environment handed to `docker compose up`.
    pub fn tenant_env(&self, request: &BringUp) -> Vec<(String, String)> {
        let mut env = vec![
            ("STUDENT_ID".to_string(), request.tenant_id.to_string()),
            ("STUDENT_NAME".to_string(), request.display_name.clone()),
            ("SSH_PORT".to_string(), request.allocation.port.to_string()),
            (
                "SUBNET_ID".to_string(),
                request.allocation.subnet_id.to_string(),
            ),
            (
                "NETWORK_NAME".to_string(),
                self.network_name(&request.tenant_id),
            ),
        ];
        if let Some(secret) = &request.secret {
            env.push(("STUDENT_PASSWORD".to_string(), secret.clone()));
        }
        env
    }

    /// Minimal environment for commands that only need to find the project.
    fn lookup_env(&self, tenant_id: &TenantId) -> Vec<(String, String)> {
        vec![
            ("STUDENT_ID".to_string(), tenant_id.to_string()),
            ("NETWORK_NAME".to_string(), self.network_name(tenant_id)),
        ]
    }

    /// Returns true if docker needs sudo on this host (`docker info` fails).
    pub async fn detect_sudo() -> bool {
        let status = Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        !matches!(status, Ok(s) if s.success())
    }

    /// Build every image in the compose file, streaming output to the terminal.
    pub async fn build_images(&self) -> Result<(), SubstrateError> {
        let args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
            "build".to_string(),
        ];
        let (program, argv) = self.command_line(&args, &[]);
        let rendered = display_command(&args);
        info!(command = %rendered, "Building images");

        let status = Command::new(&program)
            .args(&argv)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| SubstrateError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SubstrateError::CommandFailed {
                command: rendered,
                status: status.to_string(),
                stderr: "see output above".to_string(),
            })
        }
    }

    /// Interactive shell into one container of a tenant environment.
    ///
    /// Compose names containers `<project>-<service>-1`.
    pub fn exec_command(&self, tenant_id: &TenantId, service: &str) -> std::process::Command {
        let container = format!("{}-{}-1", self.project_name(tenant_id), service);
        let args = vec![
            "exec".to_string(),
            "-it".to_string(),
            container,
            "/bin/bash".to_string(),
        ];
        let (program, argv) = self.command_line(&args, &[]);
        let mut cmd = std::process::Command::new(program);
        cmd.args(argv);
        cmd
    }

    /// Resolve the program and argv for a docker invocation.
    ///
    /// With sudo, variables are inlined through `sudo env K=V docker ...`
    /// because sudo drops the caller's environment.
    fn command_line(&self, args: &[String], env: &[(String, String)]) -> (String, Vec<String>) {
        if !self.use_sudo {
            return ("docker".to_string(), args.to_vec());
        }

        let mut argv = Vec::with_capacity(args.len() + env.len() + 2);
        if !env.is_empty() {
            argv.push("env".to_string());
            argv.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
        }
        argv.push("docker".to_string());
        argv.extend(args.iter().cloned());
        ("sudo".to_string(), argv)
    }

    /// Arguments for a project-scoped compose command.
    fn compose_args(&self, tenant_id: &TenantId, tail: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
            "-p".to_string(),
            self.project_name(tenant_id),
        ];
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }

    /// Run a docker command to completion and return its stdout.
    async fn run(&self, args: Vec<String>, env: &[(String, String)]) -> Result<String, SubstrateError> {
        let (program, argv) = self.command_line(&args, env);
        let rendered = display_command(&args);
        debug!(command = %rendered, "Running");

        let mut cmd = Command::new(&program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.use_sudo {
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let output = cmd.output().await.map_err(|source| SubstrateError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(SubstrateError::CommandFailed {
                command: rendered,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn subnet_of(&self, tenant_id: &TenantId) -> Option<u8> {
        let args = vec![
            "network".to_string(),
            "inspect".to_string(),
            self.network_name(tenant_id),
        ];
        match self.run(args, &[]).await {
            Ok(stdout) => parse_network_subnet(&stdout),
            Err(e) => {
                debug!(tenant_id = %tenant_id, error = %e, "Network not inspectable");
                None
            }
        }
    }
}

#[async_trait]
impl Substrate for ComposeSubstrate {
    async fn bring_up(&self, request: &BringUp) -> Result<(), SubstrateError> {
        info!(
            tenant_id = %request.tenant_id,
            port = request.allocation.port,
            subnet_id = request.allocation.subnet_id,
            "Bringing up environment"
        );
        let args = self.compose_args(&request.tenant_id, &["up", "-d"]);
        self.run(args, &self.tenant_env(request)).await?;
        Ok(())
    }

    async fn tear_down(&self, tenant_id: &TenantId) -> Result<(), SubstrateError> {
        info!(tenant_id = %tenant_id, "Tearing down environment");
        let args = self.compose_args(tenant_id, &["down", "--remove-orphans"]);
        self.run(args, &self.lookup_env(tenant_id)).await?;
        Ok(())
    }

    async fn status(&self, tenant_id: &TenantId) -> Result<ObservedTenant, SubstrateError> {
        let args = self.compose_args(tenant_id, &["ps", "-a", "--format", "json"]);
        let stdout = self.run(args, &self.lookup_env(tenant_id)).await?;
        let entries: Vec<PsEntry> = parse_json_records(&stdout)?;

        let subnet_id = if entries.is_empty() {
            None
        } else {
            self.subnet_of(tenant_id).await
        };

        Ok(observed_from_ps(tenant_id.clone(), &self.roles, entries, subnet_id))
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, SubstrateError> {
        let args = vec![
            "compose".to_string(),
            "ls".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run(args, &[]).await?;
        let projects: Vec<ProjectEntry> = parse_json_records(&stdout)?;
        Ok(tenants_from_projects(&self.project_prefix, projects))
    }
}

fn display_command(args: &[String]) -> String {
    format!("docker {}", args.join(" "))
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    service: String,
    state: String,
    #[serde(default)]
    publishers: Option<Vec<Publisher>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Publisher {
    #[serde(default)]
    target_port: u16,
    #[serde(default)]
    published_port: u16,
}

/// One row of `docker compose ls --format json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProjectEntry {
    name: String,
}

/// Parse compose JSON output.
///
/// Depending on the compose version this is either one JSON array or one
/// object per line.
fn parse_json_records<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>, SubstrateError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| SubstrateError::Parse(e.to_string()));
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| SubstrateError::Parse(e.to_string())))
        .collect()
}

fn observed_from_ps(
    tenant_id: TenantId,
    roles: &[String],
    entries: Vec<PsEntry>,
    subnet_id: Option<u8>,
) -> ObservedTenant {
    let mut observed = ObservedTenant::absent(tenant_id);
    for role in roles {
        observed
            .containers
            .insert(role.clone(), ContainerState::Absent);
    }

    for entry in entries {
        let state = if entry.state.eq_ignore_ascii_case("running") {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        };
        if observed.bound_port.is_none() {
            observed.bound_port = entry
                .publishers
                .iter()
                .flatten()
                .find(|p| p.target_port == SSH_CONTAINER_PORT && p.published_port != 0)
                .map(|p| p.published_port);
        }
        observed.containers.insert(entry.service, state);
    }

    observed.subnet_id = subnet_id;
    observed
}

fn tenants_from_projects(prefix: &str, projects: Vec<ProjectEntry>) -> Vec<TenantId> {
    let mut tenants: Vec<TenantId> = projects
        .into_iter()
        .filter_map(|p| {
            let raw = p.name.strip_prefix(prefix)?;
            match TenantId::parse(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!(project = %p.name, error = %e, "Ignoring project with foreign name");
                    None
                }
            }
        })
        .collect();
    tenants.sort();
    tenants.dedup();
    tenants
}

/// Extract the subnet id from `docker network inspect` output.
fn parse_network_subnet(stdout: &str) -> Option<u8> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let configs = value.get(0)?.get("IPAM")?.get("Config")?.as_array()?;
    configs
        .iter()
        .filter_map(|c| c.get("Subnet")?.as_str())
        .find_map(subnet_id_from_cidr)
}

/// `172.20.X.0/24` → `X`.
fn subnet_id_from_cidr(cidr: &str) -> Option<u8> {
    cidr.strip_prefix("172.20.")?
        .strip_suffix(".0/24")?
        .parse()
        .ok()
}
