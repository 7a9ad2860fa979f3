//! Filesystem collaborator.
//!
//! The maintenance components only need six primitives from the distributed
//! filesystem: existence checks, listings, sizes, recursive deletes, mkdir and
//! chown. [`FileSystem`] captures exactly that set; [`HdfsShell`] provides it
//! through the `hdfs dfs` command line client.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MaintError, Result};
use crate::exec::{display_command, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One listed entry, as seen at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub path: String,
    pub modification_time: DateTime<Utc>,
    pub kind: EntryKind,
    pub length: u64,
}

impl FsEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Logical size of a path, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEntry {
    pub path: String,
    pub length: u64,
}

/// Per-path result of a mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResult {
    pub path: String,
    pub success: bool,
    pub error: Option<String>,
}

impl PathResult {
    pub fn ok(path: &str) -> Self {
        Self {
            path: path.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failed(path: &str, error: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Primitives consumed from the distributed filesystem.
///
/// Listing and size failures are returned as errors. Mutating calls report
/// per-path outcomes so one failing path never hides the others.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn list(&self, paths: &[String], recursive: bool) -> Result<Vec<FsEntry>>;

    async fn size(
        &self,
        paths: &[String],
        include_toplevel: bool,
        include_children: bool,
    ) -> Result<Vec<SizeEntry>>;

    async fn delete(&self, paths: &[String], recurse: bool) -> Vec<PathResult>;

    async fn mkdir(&self, paths: &[String]) -> Vec<PathResult>;

    async fn chown(&self, paths: &[String], owner: &str) -> Vec<PathResult>;
}

/// [`FileSystem`] driven through `hdfs dfs`.
pub struct HdfsShell {
    runner: Arc<dyn CommandRunner>,
    hdfs_bin: String,
}

impl HdfsShell {
    pub fn new(runner: Arc<dyn CommandRunner>, hdfs_bin: impl Into<String>) -> Self {
        Self {
            runner,
            hdfs_bin: hdfs_bin.into(),
        }
    }

    fn dfs_args(args: &[&str]) -> Vec<String> {
        std::iter::once("dfs")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    /// Runs one mutating command and folds every failure into a [`PathResult`].
    async fn mutate(&self, path: &str, args: Vec<String>) -> PathResult {
        match self.runner.run(&self.hdfs_bin, &args).await {
            Ok(out) if out.success() => PathResult::ok(path),
            Ok(out) => PathResult::failed(path, out.failure_reason()),
            Err(e) => PathResult::failed(path, e.to_string()),
        }
    }
}

#[async_trait]
impl FileSystem for HdfsShell {
    async fn exists(&self, path: &str) -> Result<bool> {
        let args = Self::dfs_args(&["-test", "-e", path]);
        let out = self.runner.run(&self.hdfs_bin, &args).await?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(MaintError::Command {
                command: display_command(&self.hdfs_bin, &args),
                reason: out.failure_reason(),
            }),
        }
    }

    async fn list(&self, paths: &[String], recursive: bool) -> Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        for path in paths {
            let mut args = Self::dfs_args(&["-ls"]);
            if recursive {
                args.push("-R".to_string());
            }
            args.push(path.clone());

            let out = self
                .runner
                .run(&self.hdfs_bin, &args)
                .await
                .map_err(|e| MaintError::Scan {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            if !out.success() {
                return Err(MaintError::Scan {
                    path: path.clone(),
                    reason: out.failure_reason(),
                });
            }

            for line in out.stdout.lines() {
                if line.trim().is_empty() || line.starts_with("Found ") {
                    continue;
                }
                match parse_ls_line(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::debug!("skipping listing line: {}", e),
                }
            }
        }
        Ok(entries)
    }

    async fn size(
        &self,
        paths: &[String],
        include_toplevel: bool,
        include_children: bool,
    ) -> Result<Vec<SizeEntry>> {
        let mut sizes = Vec::new();
        for path in paths {
            let mut modes = Vec::new();
            if include_toplevel {
                modes.push(Self::dfs_args(&["-du", "-s", path.as_str()]));
            }
            if include_children {
                modes.push(Self::dfs_args(&["-du", path.as_str()]));
            }
            for args in modes {
                let out = self.runner.run(&self.hdfs_bin, &args).await?;
                if !out.success() {
                    return Err(MaintError::Command {
                        command: display_command(&self.hdfs_bin, &args),
                        reason: out.failure_reason(),
                    });
                }
                for line in out.stdout.lines().filter(|l| !l.trim().is_empty()) {
                    sizes.push(parse_du_line(line)?);
                }
            }
        }
        Ok(sizes)
    }

    async fn delete(&self, paths: &[String], recurse: bool) -> Vec<PathResult> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let mut args = Self::dfs_args(&["-rm"]);
            if recurse {
                args.push("-r".to_string());
            }
            args.push("-skipTrash".to_string());
            args.push(path.clone());
            results.push(self.mutate(path, args).await);
        }
        results
    }

    async fn mkdir(&self, paths: &[String]) -> Vec<PathResult> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let args = Self::dfs_args(&["-mkdir", path.as_str()]);
            results.push(self.mutate(path, args).await);
        }
        results
    }

    async fn chown(&self, paths: &[String], owner: &str) -> Vec<PathResult> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let args = Self::dfs_args(&["-chown", owner, path.as_str()]);
            results.push(self.mutate(path, args).await);
        }
        results
    }
}

/// Splits off `n` whitespace separated fields and returns them with the rest
/// of the line, which keeps embedded spaces intact.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

/// Parses one `hdfs dfs -ls` line:
/// `drwxr-xr-x   - hdfs supergroup          0 2024-01-01 12:00 /tmp/a`.
///
/// The client prints timestamps in the local timezone at minute precision.
pub fn parse_ls_line(line: &str) -> Result<FsEntry> {
    let bad = || MaintError::Parse {
        what: "ls line",
        input: line.to_string(),
    };

    let (fields, path) = split_fields(line, 7).ok_or_else(bad)?;
    if path.is_empty() {
        return Err(bad());
    }
    let kind = match fields[0].chars().next() {
        Some('d') => EntryKind::Directory,
        Some(_) => EntryKind::File,
        None => return Err(bad()),
    };
    let length = fields[4].parse::<u64>().map_err(|_| bad())?;
    let stamp = format!("{} {}", fields[5], fields[6]);
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M").map_err(|_| bad())?;
    let modification_time = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(bad)?
        .with_timezone(&Utc);

    Ok(FsEntry {
        path: path.trim_end().to_string(),
        modification_time,
        kind,
        length,
    })
}

/// Parses one `hdfs dfs -du` line. Newer clients print the logical size
/// followed by the raw disk usage; older ones only the logical size.
pub fn parse_du_line(line: &str) -> Result<SizeEntry> {
    let bad = || MaintError::Parse {
        what: "du line",
        input: line.to_string(),
    };

    let (fields, mut rest) = split_fields(line, 1).ok_or_else(bad)?;
    let length = fields[0].parse::<u64>().map_err(|_| bad())?;
    if let Some((next, after)) = split_fields(rest, 1) {
        if next[0].chars().all(|c| c.is_ascii_digit()) && !after.is_empty() {
            rest = after;
        }
    }
    if rest.is_empty() {
        return Err(bad());
    }
    Ok(SizeEntry {
        path: rest.trim_end().to_string(),
        length,
    })
}
