//! External collaborators: the upstream repository source, the package
//! installer, and the host platform's plugin registry.
//!
//! The daemon only sees these traits. The shipped implementation shells out to
//! configured commands so the daemon can drive any host platform.

use serde::Deserialize;
use std::collections::HashSet;
use std::process::Command;

use crate::config::CommandsSection;

pub const REPOSITORY_ENV: &str = "PLUGIN_SYNC_REPOSITORY";

/// Raw failure text from a collaborator. Classified by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorError {
    pub message: String,
    /// No command is configured for this collaborator. Never pattern matched.
    pub not_configured: bool,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            not_configured: false,
        }
    }

    pub fn not_configured(label: &str) -> Self {
        Self {
            message: format!("no {} command configured", label),
            not_configured: true,
        }
    }
}

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuotaReport {
    pub remaining: u64,
    pub limit: u64,
    /// Unix seconds.
    pub reset_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckOutcome {
    pub is_plugin: bool,
    #[serde(default)]
    pub rate_limit: Option<QuotaReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundTruth {
    pub installed: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub installed: HashSet<String>,
    #[serde(default)]
    pub active: HashSet<String>,
}

impl RegistrySnapshot {
    pub fn ground_truth(&self, repository: &str) -> GroundTruth {
        let active = self.active.contains(repository);
        GroundTruth {
            installed: active || self.installed.contains(repository),
            active,
        }
    }
}

pub trait RepositorySource: Send + Sync {
    fn check(&self, repository: &str) -> Result<CheckOutcome, CollaboratorError>;
}

pub trait Installer: Send + Sync {
    fn install(&self, repository: &str) -> Result<(), CollaboratorError>;
    fn activate(&self, repository: &str) -> Result<(), CollaboratorError>;
    fn deactivate(&self, repository: &str) -> Result<(), CollaboratorError>;
}

pub trait HostRegistry: Send + Sync {
    fn snapshot(&self) -> Result<RegistrySnapshot, CollaboratorError>;
}

/// Collaborators backed by `sh -c` commands from the daemon config.
#[derive(Debug, Clone, Default)]
pub struct CommandCollaborators {
    commands: CommandsSection,
}

impl CommandCollaborators {
    pub fn new(commands: CommandsSection) -> Self {
        Self { commands }
    }
}

impl RepositorySource for CommandCollaborators {
    fn check(&self, repository: &str) -> Result<CheckOutcome, CollaboratorError> {
        let stdout = run_configured(self.commands.check.as_deref(), "check", Some(repository))?;
        serde_json::from_str(stdout.trim()).map_err(|err| {
            CollaboratorError::new(format!("check command returned invalid JSON: {}", err))
        })
    }
}

impl Installer for CommandCollaborators {
    fn install(&self, repository: &str) -> Result<(), CollaboratorError> {
        run_configured(self.commands.install.as_deref(), "install", Some(repository)).map(|_| ())
    }

    fn activate(&self, repository: &str) -> Result<(), CollaboratorError> {
        run_configured(self.commands.activate.as_deref(), "activate", Some(repository))
            .map(|_| ())
    }

    fn deactivate(&self, repository: &str) -> Result<(), CollaboratorError> {
        run_configured(
            self.commands.deactivate.as_deref(),
            "deactivate",
            Some(repository),
        )
        .map(|_| ())
    }
}

impl HostRegistry for CommandCollaborators {
    fn snapshot(&self) -> Result<RegistrySnapshot, CollaboratorError> {
        let stdout = run_configured(self.commands.registry.as_deref(), "registry", None)?;
        serde_json::from_str(stdout.trim()).map_err(|err| {
            CollaboratorError::new(format!("registry command returned invalid JSON: {}", err))
        })
    }
}

fn run_configured(
    command: Option<&str>,
    label: &str,
    repository: Option<&str>,
) -> Result<String, CollaboratorError> {
    let command = command
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CollaboratorError::not_configured(label))?;

    let mut process = Command::new("sh");
    process.arg("-c").arg(command);
    if let Some(repository) = repository {
        process.env(REPOSITORY_ENV, repository);
    }

    tracing::debug!(label, repository = ?repository, "Running collaborator command");
    let output = process
        .output()
        .map_err(|err| CollaboratorError::new(format!("failed to run {} command: {}", label, err)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("{} command exited with {}", label, output.status)
    } else {
        stderr
    };
    tracing::warn!(label, repository = ?repository, status = %output.status, "Collaborator command failed");
    Err(CollaboratorError::new(message))
}
