use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{age_from_secs, MaintConfig};
use crate::coordinator::{local_hostname, CoordinatorGate, GateDecision};
use crate::error::MaintError;
use crate::exec::{CommandRunner, ProcessRunner};
use crate::fs::{FileSystem, HdfsShell};
use crate::protection::ProtectionPolicy;
use crate::provision::{IdentitySource, PasswdSource, Provisioner};
use crate::report::{Reporter, TracingReporter};
use crate::retention::{RetentionExecutor, RetentionRequest, RunStatus};
use crate::topology::{HdfsGetconf, TopologySource};
use crate::usage::{render, UsageAggregator, UsageQuery, UsageStatus, GIB};

#[derive(Parser)]
#[command(name = "dfs-maint")]
#[command(about = "Maintenance agent for an HA distributed filesystem", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        env = "DFS_MAINT_CONFIG",
        default_value = "/etc/dfs-maint/dfs-maint.toml"
    )]
    pub config: PathBuf,

    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report per-directory usage under a path
    Du {
        path: String,
        #[arg(short = 'H', long)]
        human: bool,
        /// Only report children larger than this many GB
        #[arg(short = 'l', long = "larger", default_value = "0")]
        larger_gb: u64,
        #[arg(short, long)]
        total: bool,
    },
    /// Remove aged entries under a scratch path
    Clean {
        path: String,
        /// Minimum age in seconds; defaults to `cleanup_age_secs`
        #[arg(short, long)]
        age: Option<u64>,
        #[arg(short, long)]
        recurse: bool,
        /// Actually delete; without it the run only reports
        #[arg(long)]
        delete: bool,
    },
    /// Create missing home directories for regular accounts
    Provision,
    /// Show which metadata server is active
    Active,
}

/// Lines to print and the process exit code of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub lines: Vec<String>,
    pub exit_code: u8,
}

impl CommandResult {
    fn success(lines: Vec<String>) -> Self {
        Self { lines, exit_code: 0 }
    }

    fn failure(lines: Vec<String>) -> Self {
        Self { lines, exit_code: 1 }
    }
}

/// The collaborators a command runs against.
pub struct Agent {
    pub config: MaintConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub fs: Arc<dyn FileSystem>,
    pub topology: Arc<dyn TopologySource>,
    pub identities: Arc<dyn IdentitySource>,
    pub reporter: Arc<dyn Reporter>,
}

impl Agent {
    /// Wires the process-backed adapters described by `config`.
    pub fn from_config(config: MaintConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.command_timeout()));
        let fs = Arc::new(HdfsShell::new(runner.clone(), config.hdfs_bin.clone()));
        let topology = Arc::new(HdfsGetconf::new(
            runner.clone(),
            config.hdfs_bin.clone(),
            config.nameservice.clone(),
        ));
        let identities = Arc::new(PasswdSource::new(runner.clone(), config.passwd_file.clone()));
        Self {
            config,
            runner,
            fs,
            topology,
            identities,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub async fn execute(&self, command: &Command) -> Result<CommandResult> {
        match command {
            Command::Du {
                path,
                human,
                larger_gb,
                total,
            } => {
                let query = UsageQuery {
                    root: path.clone(),
                    min_size_bytes: larger_gb.saturating_mul(GIB),
                    human_readable: *human,
                    total: *total,
                };
                self.du(&query).await
            }
            Command::Clean {
                path,
                age,
                recurse,
                delete,
            } => {
                let max_age = age_from_secs(age.unwrap_or(self.config.cleanup_age_secs))?;
                let request = RetentionRequest {
                    root: path.clone(),
                    recursive: *recurse,
                    max_age,
                    dry_run: !delete,
                };
                self.clean(&request).await
            }
            Command::Provision => self.provision().await,
            Command::Active => self.active().await,
        }
    }

    pub async fn du(&self, query: &UsageQuery) -> Result<CommandResult> {
        let report = UsageAggregator::new(self.fs.clone(), self.reporter.clone())
            .aggregate(&query.root, query.min_size_bytes)
            .await?;
        let lines = render(&report, query);
        if report.status == UsageStatus::NotFound {
            return Ok(CommandResult::failure(lines));
        }
        Ok(CommandResult::success(lines))
    }

    pub async fn clean(&self, request: &RetentionRequest) -> Result<CommandResult> {
        ensure_ticket(self.runner.as_ref(), &self.config).await?;
        if let Some(refusal) = self.authorize().await? {
            return Ok(refusal);
        }

        let policy =
            ProtectionPolicy::with_defaults().with_patterns(&self.config.extra_protected_patterns)?;
        let report = RetentionExecutor::new(self.fs.clone(), policy, self.reporter.clone())
            .verify_deletes(self.config.verify_deletes)
            .run(request, Utc::now())
            .await?;

        let lines = vec![report.summary()];
        if report.status == RunStatus::NotFound {
            return Ok(CommandResult::failure(lines));
        }
        Ok(CommandResult::success(lines))
    }

    pub async fn provision(&self) -> Result<CommandResult> {
        ensure_ticket(self.runner.as_ref(), &self.config).await?;
        if let Some(refusal) = self.authorize().await? {
            return Ok(refusal);
        }

        let records = self.identities.records().await?;
        tracing::info!("{} accounts enumerated", records.len());
        let report = Provisioner::new(self.fs.clone(), self.reporter.clone())
            .home_prefix(self.config.home_prefix.clone())
            .uid_bounds(self.config.min_uid, self.config.max_uid)
            .run(records)
            .await;
        Ok(CommandResult::success(vec![report.summary()]))
    }

    pub async fn active(&self) -> Result<CommandResult> {
        let line = match self.gate().await.check().await? {
            GateDecision::Authoritative(active) => {
                format!("{} ({}) is active, this host", active.server.name, active.host)
            }
            GateDecision::NotAuthoritative { active, local_host } => format!(
                "{} ({}) is active, not this host ({})",
                active.server.name, active.host, local_host
            ),
            GateDecision::NoActive(none) => {
                return Ok(CommandResult::failure(vec![none.to_string()]));
            }
        };
        Ok(CommandResult::success(vec![line]))
    }

    async fn gate(&self) -> CoordinatorGate {
        let local = local_hostname(
            self.runner.as_ref(),
            &self.config.hostname_bin,
            self.config.local_hostname.as_deref(),
        )
        .await;
        tracing::debug!("local host is {}", local);
        CoordinatorGate::new(self.topology.clone(), self.reporter.clone(), local)
    }

    /// `None` when this host may mutate the namespace, otherwise the result
    /// to exit with.
    async fn authorize(&self) -> Result<Option<CommandResult>> {
        match self.gate().await.check().await? {
            GateDecision::Authoritative(_) => Ok(None),
            GateDecision::NotAuthoritative { active, local_host } => {
                Ok(Some(CommandResult::failure(vec![format!(
                    "active node {} is not this host {}, nothing to do",
                    active.host, local_host
                )])))
            }
            GateDecision::NoActive(none) => {
                Ok(Some(CommandResult::failure(vec![none.to_string()])))
            }
        }
    }
}

/// Fails unless a valid Kerberos ticket is cached. Skipped when
/// `require_ticket` is off.
pub async fn ensure_ticket(
    runner: &dyn CommandRunner,
    config: &MaintConfig,
) -> std::result::Result<(), MaintError> {
    if !config.require_ticket {
        return Ok(());
    }
    let out = runner
        .run(&config.klist_bin, &["-s".to_string()])
        .await
        .map_err(|e| MaintError::Credentials(e.to_string()))?;
    if out.success() {
        Ok(())
    } else {
        Err(MaintError::Credentials(
            "no valid Kerberos ticket in the credential cache, run kinit".to_string(),
        ))
    }
}

impl Cli {
    pub async fn run(self) -> Result<CommandResult> {
        let config = MaintConfig::load_or_default(&self.config)?;
        Agent::from_config(config).execute(&self.command).await
    }
}
