//! Age-gated scratch retention.
//!
//! [`RetentionScanner`] lists a root once, [`classify`] decides per entry and
//! [`RetentionExecutor`] carries the decision out, or only reports it in a dry
//! run. Protection always wins over age, and a failed delete is recorded
//! without stopping the batch.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{MaintError, Result};
use crate::fs::{FileSystem, FsEntry, PathResult};
use crate::protection::ProtectionPolicy;
use crate::report::{AuditEvent, Reporter};

/// Lists retention candidates through the filesystem collaborator.
pub struct RetentionScanner {
    fs: Arc<dyn FileSystem>,
}

impl RetentionScanner {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Immediate children of `root`, or its whole subtree when `recursive`.
    pub async fn scan(&self, root: &str, recursive: bool) -> Result<ScanEntries> {
        let entries = self.fs.list(&[root.to_string()], recursive).await?;
        Ok(ScanEntries {
            inner: entries.into_iter(),
        })
    }
}

/// Entries of one listing, consumed once.
#[derive(Debug)]
pub struct ScanEntries {
    inner: std::vec::IntoIter<FsEntry>,
}

impl Iterator for ScanEntries {
    type Item = FsEntry;

    fn next(&mut self) -> Option<FsEntry> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Delete,
    SkipProtected,
    SkipTooNew,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDecision {
    pub entry: FsEntry,
    pub outcome: Outcome,
    pub age: Duration,
    /// Protecting rule, set for [`Outcome::SkipProtected`].
    pub rule: Option<String>,
}

/// Decides what happens to one entry. Entries stamped in the future have a
/// negative age and are always too new.
pub fn classify(
    entry: &FsEntry,
    now: DateTime<Utc>,
    max_age: Duration,
    policy: &ProtectionPolicy,
) -> RetentionDecision {
    let age = now - entry.modification_time;
    let (outcome, rule) = match policy.matched_rule(&entry.path) {
        Some(rule) => (Outcome::SkipProtected, Some(rule.to_string())),
        None if age < max_age => (Outcome::SkipTooNew, None),
        None => (Outcome::Delete, None),
    };
    RetentionDecision {
        entry: entry.clone(),
        outcome,
        age,
        rule,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Protected { rule: String },
    TooNew,
    /// An ancestor directory was already removed in this run.
    Covered { ancestor: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    Skipped(SkipReason),
    WouldDelete(String),
    Deleted(String),
    /// Delete succeeded but the path was still visible afterwards.
    DeletedUnverified(String),
    Failed { path: String, reason: String },
}

impl ExecutionOutcome {
    fn removes(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::WouldDelete(_)
                | ExecutionOutcome::Deleted(_)
                | ExecutionOutcome::DeletedUnverified(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    NotFound,
}

/// What one retention run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub root: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub deleted: usize,
    pub would_delete: usize,
    pub unverified: usize,
    pub protected: usize,
    pub too_new: usize,
    pub covered: usize,
    pub failures: Vec<(String, String)>,
}

impl RetentionReport {
    fn new(root: &str, status: RunStatus, dry_run: bool) -> Self {
        Self {
            root: root.to_string(),
            status,
            dry_run,
            deleted: 0,
            would_delete: 0,
            unverified: 0,
            protected: 0,
            too_new: 0,
            covered: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Skipped(SkipReason::Protected { .. }) => self.protected += 1,
            ExecutionOutcome::Skipped(SkipReason::TooNew) => self.too_new += 1,
            ExecutionOutcome::Skipped(SkipReason::Covered { .. }) => self.covered += 1,
            ExecutionOutcome::WouldDelete(_) => self.would_delete += 1,
            ExecutionOutcome::Deleted(_) => self.deleted += 1,
            ExecutionOutcome::DeletedUnverified(_) => {
                self.deleted += 1;
                self.unverified += 1;
            }
            ExecutionOutcome::Failed { path, reason } => self.failures.push((path, reason)),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn summary(&self) -> String {
        match self.status {
            RunStatus::NotFound => format!("{} is not found", self.root),
            RunStatus::Completed if self.dry_run => format!(
                "{}: would delete {}, protected {}, too new {}, covered {} (dry run, pass --delete to commit)",
                self.root, self.would_delete, self.protected, self.too_new, self.covered
            ),
            RunStatus::Completed => format!(
                "{}: deleted {} ({} unverified), failed {}, protected {}, too new {}, covered {}",
                self.root,
                self.deleted,
                self.unverified,
                self.failed(),
                self.protected,
                self.too_new,
                self.covered
            ),
        }
    }
}

/// Parameters of one retention run.
#[derive(Debug, Clone)]
pub struct RetentionRequest {
    pub root: String,
    pub recursive: bool,
    pub max_age: Duration,
    pub dry_run: bool,
}

pub struct RetentionExecutor {
    fs: Arc<dyn FileSystem>,
    policy: ProtectionPolicy,
    reporter: Arc<dyn Reporter>,
    verify_deletes: bool,
}

impl RetentionExecutor {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        policy: ProtectionPolicy,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            fs,
            policy,
            reporter,
            verify_deletes: true,
        }
    }

    pub fn verify_deletes(mut self, verify: bool) -> Self {
        self.verify_deletes = verify;
        self
    }

    pub fn policy(&self) -> &ProtectionPolicy {
        &self.policy
    }

    /// Carries out one decision. Only [`Outcome::Delete`] outside a dry run
    /// reaches the filesystem.
    pub async fn execute(&self, decision: &RetentionDecision, dry_run: bool) -> ExecutionOutcome {
        let path = &decision.entry.path;
        match decision.outcome {
            Outcome::SkipProtected => {
                let rule = decision.rule.clone().unwrap_or_default();
                self.reporter.report(AuditEvent::SkipProtected {
                    path: path.clone(),
                    rule: rule.clone(),
                });
                ExecutionOutcome::Skipped(SkipReason::Protected { rule })
            }
            Outcome::SkipTooNew => {
                self.reporter.report(AuditEvent::SkipTooNew {
                    path: path.clone(),
                    age_secs: decision.age.num_seconds(),
                });
                ExecutionOutcome::Skipped(SkipReason::TooNew)
            }
            Outcome::Delete if dry_run => {
                self.reporter.report(AuditEvent::WouldDelete {
                    path: path.clone(),
                    age_secs: decision.age.num_seconds(),
                });
                ExecutionOutcome::WouldDelete(path.clone())
            }
            Outcome::Delete => self.delete(path).await,
        }
    }

    async fn delete(&self, path: &str) -> ExecutionOutcome {
        let result = self
            .fs
            .delete(&[path.to_string()], true)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| PathResult::failed(path, "no result returned"));

        if !result.success {
            let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
            self.reporter.report(AuditEvent::DeleteFailed {
                path: path.to_string(),
                reason: reason.clone(),
            });
            return ExecutionOutcome::Failed {
                path: path.to_string(),
                reason,
            };
        }

        if self.verify_deletes {
            let still_there = match self.fs.exists(path).await {
                Ok(present) => present,
                Err(e) => {
                    tracing::debug!("post-delete check of {} failed: {}", path, e);
                    true
                }
            };
            if still_there {
                self.reporter.report(AuditEvent::DeleteUnverified {
                    path: path.to_string(),
                });
                return ExecutionOutcome::DeletedUnverified(path.to_string());
            }
        }

        self.reporter.report(AuditEvent::Deleted {
            path: path.to_string(),
        });
        ExecutionOutcome::Deleted(path.to_string())
    }

    /// Scans the root and applies the policy to every entry.
    ///
    /// A missing root yields a `NotFound` report. A root that exists but
    /// cannot be listed is a scan failure.
    pub async fn run(&self, request: &RetentionRequest, now: DateTime<Utc>) -> Result<RetentionReport> {
        let root = request.root.as_str();
        let present = self.fs.exists(root).await.map_err(|e| MaintError::Scan {
            path: root.to_string(),
            reason: e.to_string(),
        })?;
        if !present {
            self.reporter.report(AuditEvent::RootNotFound {
                path: root.to_string(),
            });
            return Ok(RetentionReport::new(root, RunStatus::NotFound, request.dry_run));
        }

        let entries = RetentionScanner::new(self.fs.clone())
            .scan(root, request.recursive)
            .await?;
        let mut report = RetentionReport::new(root, RunStatus::Completed, request.dry_run);
        // Recursive listings are depth first, so a removed directory's subtree
        // follows it contiguously and one ancestor is enough to track.
        let mut removed_dir: Option<String> = None;

        for entry in entries {
            if let Some(ancestor) = removed_dir.take() {
                if is_beneath(&entry.path, &ancestor) {
                    self.reporter.report(AuditEvent::SkipCovered {
                        path: entry.path.clone(),
                        ancestor: ancestor.clone(),
                    });
                    report.record(ExecutionOutcome::Skipped(SkipReason::Covered {
                        ancestor: ancestor.clone(),
                    }));
                    removed_dir = Some(ancestor);
                    continue;
                }
            }

            let decision = classify(&entry, now, request.max_age, &self.policy);
            let outcome = self.execute(&decision, request.dry_run).await;
            if entry.is_dir() && outcome.removes() {
                removed_dir = Some(entry.path.clone());
            }
            report.record(outcome);
        }

        Ok(report)
    }
}

fn is_beneath(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.len() > dir.len() && path.starts_with(dir) && path[dir.len()..].starts_with('/')
}
