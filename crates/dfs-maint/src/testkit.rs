//! In-memory collaborators for tests and offline rehearsals.
//!
//! Each double records the calls it receives so tests can assert on side
//! effects (for example that a dry run never issues a delete).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{MaintError, Result};
use crate::exec::{display_command, CommandOutput, CommandRunner};
use crate::fs::{EntryKind, FileSystem, FsEntry, PathResult, SizeEntry};
use crate::provision::{IdentityRecord, IdentitySource};
use crate::report::{AuditEvent, Reporter};
use crate::topology::{ClusterTopology, ServiceRole, TopologySource};

/// A call received by [`MemoryFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCall {
    Exists(String),
    List { paths: Vec<String>, recursive: bool },
    Size { paths: Vec<String> },
    Delete { paths: Vec<String>, recurse: bool },
    Mkdir(Vec<String>),
    Chown { paths: Vec<String>, owner: String },
}

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, FsEntry>,
    owners: HashMap<String, String>,
    calls: Vec<FsCall>,
    fail_delete: HashSet<String>,
    fail_mkdir: HashSet<String>,
    fail_chown: HashSet<String>,
    sticky: HashSet<String>,
    invisible: HashSet<String>,
    unlistable: HashSet<String>,
    unsizable: HashSet<String>,
    unreachable: HashSet<String>,
}

impl MemState {
    fn insert(&mut self, path: &str, kind: EntryKind, mtime: DateTime<Utc>, length: u64) {
        let mut parent = parent_of(path);
        while let Some(dir) = parent {
            self.entries.entry(dir.to_string()).or_insert_with(|| FsEntry {
                path: dir.to_string(),
                modification_time: mtime,
                kind: EntryKind::Directory,
                length: 0,
            });
            parent = parent_of(dir);
        }
        self.entries.insert(
            path.to_string(),
            FsEntry {
                path: path.to_string(),
                modification_time: mtime,
                kind,
                length,
            },
        );
    }

    fn present(&self, path: &str) -> bool {
        path == "/" || self.entries.contains_key(path)
    }

    fn beneath<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a FsEntry> + 'a {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.entries
            .values()
            .filter(move |e| e.path.starts_with(&prefix))
    }

    fn total_size(&self, path: &str) -> u64 {
        let own = self.entries.get(path).map(|e| e.length).unwrap_or(0);
        own + self
            .beneath(path)
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.length)
            .sum::<u64>()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

fn is_child(path: &str, dir: &str) -> bool {
    match parent_of(path) {
        Some(parent) => parent == dir,
        None => dir.is_empty(),
    }
}

/// In-memory [`FileSystem`] with call recording and failure injection.
#[derive(Default)]
pub struct MemoryFs {
    state: Mutex<MemState>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(self, f: impl FnOnce(&mut MemState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    /// Adds a directory, creating missing parents with the same timestamp.
    pub fn with_dir(self, path: &str, mtime: DateTime<Utc>) -> Self {
        self.configure(|s| s.insert(path, EntryKind::Directory, mtime, 0))
    }

    pub fn with_file(self, path: &str, mtime: DateTime<Utc>, length: u64) -> Self {
        self.configure(|s| s.insert(path, EntryKind::File, mtime, length))
    }

    pub fn fail_delete(self, path: &str) -> Self {
        self.configure(|s| {
            s.fail_delete.insert(path.to_string());
        })
    }

    pub fn fail_mkdir(self, path: &str) -> Self {
        self.configure(|s| {
            s.fail_mkdir.insert(path.to_string());
        })
    }

    pub fn fail_chown(self, path: &str) -> Self {
        self.configure(|s| {
            s.fail_chown.insert(path.to_string());
        })
    }

    /// Deletes of `path` report success but leave it in place.
    pub fn sticky(self, path: &str) -> Self {
        self.configure(|s| {
            s.sticky.insert(path.to_string());
        })
    }

    /// Existence checks of `path` always answer false.
    pub fn invisible(self, path: &str) -> Self {
        self.configure(|s| {
            s.invisible.insert(path.to_string());
        })
    }

    pub fn unlistable(self, path: &str) -> Self {
        self.configure(|s| {
            s.unlistable.insert(path.to_string());
        })
    }

    pub fn unsizable(self, path: &str) -> Self {
        self.configure(|s| {
            s.unsizable.insert(path.to_string());
        })
    }

    /// Existence checks of `path` fail.
    pub fn unreachable(self, path: &str) -> Self {
        self.configure(|s| {
            s.unreachable.insert(path.to_string());
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }

    pub fn owner(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().owners.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<FsCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&FsCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| pred(c))
            .count()
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn exists(&self, path: &str) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::Exists(path.to_string()));
        if s.unreachable.contains(path) {
            return Err(MaintError::Command {
                command: format!("test -e {}", path),
                reason: "connection refused".to_string(),
            });
        }
        Ok(!s.invisible.contains(path) && s.present(path))
    }

    async fn list(&self, paths: &[String], recursive: bool) -> Result<Vec<FsEntry>> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::List {
            paths: paths.to_vec(),
            recursive,
        });

        let mut out = Vec::new();
        for path in paths {
            if s.unlistable.contains(path) || !s.present(path) {
                return Err(MaintError::Scan {
                    path: path.clone(),
                    reason: "no such file or directory".to_string(),
                });
            }
            if let Some(entry) = s.entries.get(path) {
                if entry.kind == EntryKind::File {
                    out.push(entry.clone());
                    continue;
                }
            }
            let dir = path.trim_end_matches('/');
            out.extend(
                s.beneath(path)
                    .filter(|e| recursive || is_child(&e.path, dir))
                    .cloned(),
            );
        }
        // depth first, like `-ls -R`: a directory's subtree precedes its later siblings
        out.sort_by(|a, b| a.path.split('/').cmp(b.path.split('/')));
        Ok(out)
    }

    async fn size(
        &self,
        paths: &[String],
        include_toplevel: bool,
        include_children: bool,
    ) -> Result<Vec<SizeEntry>> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::Size {
            paths: paths.to_vec(),
        });

        let mut out = Vec::new();
        for path in paths {
            if s.unsizable.contains(path) || !s.present(path) {
                return Err(MaintError::Command {
                    command: format!("du {}", path),
                    reason: "no such file or directory".to_string(),
                });
            }
            if include_toplevel {
                out.push(SizeEntry {
                    path: path.clone(),
                    length: s.total_size(path),
                });
            }
            if include_children {
                let dir = path.trim_end_matches('/');
                let children: Vec<String> = s
                    .beneath(path)
                    .filter(|e| is_child(&e.path, dir))
                    .map(|e| e.path.clone())
                    .collect();
                for child in children {
                    let length = s.total_size(&child);
                    out.push(SizeEntry {
                        path: child,
                        length,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, paths: &[String], recurse: bool) -> Vec<PathResult> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::Delete {
            paths: paths.to_vec(),
            recurse,
        });

        let mut results = Vec::new();
        for path in paths {
            if s.fail_delete.contains(path) {
                results.push(PathResult::failed(path, "permission denied"));
            } else if !s.entries.contains_key(path) {
                results.push(PathResult::failed(path, "no such file or directory"));
            } else if !recurse && s.beneath(path).next().is_some() {
                results.push(PathResult::failed(path, "is a non-empty directory"));
            } else {
                if !s.sticky.contains(path) {
                    let doomed: Vec<String> = s.beneath(path).map(|e| e.path.clone()).collect();
                    for p in doomed {
                        s.entries.remove(&p);
                    }
                    s.entries.remove(path);
                }
                results.push(PathResult::ok(path));
            }
        }
        results
    }

    async fn mkdir(&self, paths: &[String]) -> Vec<PathResult> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::Mkdir(paths.to_vec()));

        let mut results = Vec::new();
        for path in paths {
            if s.fail_mkdir.contains(path) {
                results.push(PathResult::failed(path, "permission denied"));
            } else if s.entries.contains_key(path) {
                results.push(PathResult::failed(path, "file exists"));
            } else {
                s.insert(path, EntryKind::Directory, Utc::now(), 0);
                results.push(PathResult::ok(path));
            }
        }
        results
    }

    async fn chown(&self, paths: &[String], owner: &str) -> Vec<PathResult> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(FsCall::Chown {
            paths: paths.to_vec(),
            owner: owner.to_string(),
        });

        let mut results = Vec::new();
        for path in paths {
            if s.fail_chown.contains(path) {
                results.push(PathResult::failed(path, "permission denied"));
            } else if !s.entries.contains_key(path) {
                results.push(PathResult::failed(path, "no such file or directory"));
            } else {
                s.owners.insert(path.clone(), owner.to_string());
                results.push(PathResult::ok(path));
            }
        }
        results
    }
}

enum Scripted {
    Output(CommandOutput),
    Timeout,
}

/// [`CommandRunner`] answering from canned outputs keyed by command line.
/// Unscripted commands fail to start.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), Scripted::Output(output));
    }

    pub fn respond_timeout(&self, command: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), Scripted::Timeout);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command = display_command(program, args);
        self.calls.lock().unwrap().push(command.clone());
        match self.responses.lock().unwrap().get(&command) {
            Some(Scripted::Output(out)) => Ok(out.clone()),
            Some(Scripted::Timeout) => Err(MaintError::Timeout {
                command,
                timeout_ms: 0,
            }),
            None => Err(MaintError::Command {
                command,
                reason: "no scripted response".to_string(),
            }),
        }
    }
}

/// [`TopologySource`] with fixed roles. Servers added with
/// [`ScriptedTopology::unreachable`] fail their role query.
pub struct ScriptedTopology {
    cluster: String,
    servers: Vec<(String, Option<ServiceRole>)>,
    addresses: HashMap<String, String>,
    broken: bool,
    queries: Mutex<Vec<String>>,
}

impl ScriptedTopology {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            servers: Vec::new(),
            addresses: HashMap::new(),
            broken: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn server(mut self, name: &str, role: ServiceRole, address: &str) -> Self {
        self.servers.push((name.to_string(), Some(role)));
        self.addresses.insert(name.to_string(), address.to_string());
        self
    }

    pub fn unreachable(mut self, name: &str) -> Self {
        self.servers.push((name.to_string(), None));
        self
    }

    /// The topology itself cannot be read.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    /// Servers whose role was queried, in order.
    pub fn role_queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopologySource for ScriptedTopology {
    async fn topology(&self) -> Result<ClusterTopology> {
        if self.broken {
            return Err(MaintError::Configuration(
                "cluster configuration unavailable".to_string(),
            ));
        }
        Ok(ClusterTopology {
            cluster: self.cluster.clone(),
            servers: self.servers.iter().map(|(name, _)| name.clone()).collect(),
        })
    }

    async fn service_role(&self, _cluster: &str, server: &str) -> Result<ServiceRole> {
        self.queries.lock().unwrap().push(server.to_string());
        match self.servers.iter().find(|(name, _)| name == server) {
            Some((_, Some(role))) => Ok(*role),
            _ => Err(MaintError::Command {
                command: format!("haadmin -getServiceState {}", server),
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn server_address(&self, _cluster: &str, server: &str) -> Result<String> {
        self.addresses.get(server).cloned().ok_or_else(|| {
            MaintError::Configuration(format!("no rpc address for {}", server))
        })
    }
}

/// [`IdentitySource`] over a fixed list.
pub struct StaticIdentities {
    records: Option<Vec<IdentityRecord>>,
}

impl StaticIdentities {
    pub fn new(records: Vec<IdentityRecord>) -> Self {
        Self {
            records: Some(records),
        }
    }

    /// A source that cannot be reached.
    pub fn failing() -> Self {
        Self { records: None }
    }
}

#[async_trait]
impl IdentitySource for StaticIdentities {
    async fn records(&self) -> Result<Vec<IdentityRecord>> {
        self.records
            .clone()
            .ok_or_else(|| MaintError::Configuration("identity source unreachable".to_string()))
    }
}

/// [`Reporter`] that keeps every event.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
