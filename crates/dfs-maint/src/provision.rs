//! Home directory provisioning from the identity source.
//!
//! Every regular account gets `<home_prefix>/<username>` owned by that user.
//! Existing directories are left alone, so reruns are no-ops. A failed step
//! is reported and the batch moves on to the next user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{MaintError, Result};
use crate::exec::CommandRunner;
use crate::fs::FileSystem;
use crate::report::{AuditEvent, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityOrigin {
    Local,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub username: String,
    pub uid: u32,
    pub source: IdentityOrigin,
}

/// Enumerates accounts from every configured identity backend.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn records(&self) -> Result<Vec<IdentityRecord>>;
}

/// [`IdentitySource`] over `getent passwd`, which merges local files with
/// directory backends such as sssd/LDAP. Accounts also present in the local
/// passwd file are tagged [`IdentityOrigin::Local`].
pub struct PasswdSource {
    runner: Arc<dyn CommandRunner>,
    passwd_file: PathBuf,
}

impl PasswdSource {
    pub fn new(runner: Arc<dyn CommandRunner>, passwd_file: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            passwd_file: passwd_file.into(),
        }
    }

    async fn local_names(&self) -> HashSet<String> {
        match tokio::fs::read_to_string(&self.passwd_file).await {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| parse_passwd_line(line).map(|(name, _)| name.to_string()))
                .collect(),
            Err(e) => {
                tracing::debug!("cannot read {}: {}", self.passwd_file.display(), e);
                HashSet::new()
            }
        }
    }
}

#[async_trait]
impl IdentitySource for PasswdSource {
    async fn records(&self) -> Result<Vec<IdentityRecord>> {
        let args = vec!["passwd".to_string()];
        let out = self
            .runner
            .run("getent", &args)
            .await
            .map_err(|e| MaintError::Configuration(format!("identity source: {}", e)))?;
        if !out.success() {
            return Err(MaintError::Configuration(format!(
                "identity source: getent passwd {}",
                out.failure_reason()
            )));
        }

        let local = self.local_names().await;
        let mut records = Vec::new();
        for line in out.stdout.lines() {
            match parse_passwd_line(line) {
                Some((username, uid)) => records.push(IdentityRecord {
                    username: username.to_string(),
                    uid,
                    source: if local.contains(username) {
                        IdentityOrigin::Local
                    } else {
                        IdentityOrigin::Directory
                    },
                }),
                None if line.trim().is_empty() || line.starts_with('#') => {}
                None => tracing::debug!("skipping passwd line {:?}", line),
            }
        }
        Ok(records)
    }
}

/// A username that stays one path component below the home prefix.
fn is_safe_username(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// `name:x:uid:gid:gecos:home:shell` to `(name, uid)`.
fn parse_passwd_line(line: &str) -> Option<(&str, u32)> {
    let mut fields = line.split(':');
    let name = fields.next()?.trim();
    let _password = fields.next()?;
    let uid = fields.next()?.trim().parse().ok()?;
    if name.is_empty() || name.starts_with('#') {
        return None;
    }
    Some((name, uid))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub created: usize,
    pub existing: usize,
    pub reserved: usize,
    /// Usernames that cannot be used as a path component.
    pub rejected: usize,
    pub check_failed: usize,
    pub mkdir_failed: usize,
    pub chown_failed: usize,
    pub not_visible: usize,
}

impl ProvisionReport {
    pub fn failed(&self) -> usize {
        self.check_failed + self.mkdir_failed + self.chown_failed
    }

    pub fn summary(&self) -> String {
        format!(
            "created {}, existing {}, reserved {}, rejected {}, check failed {}, mkdir failed {}, chown failed {}, not visible {}",
            self.created,
            self.existing,
            self.reserved,
            self.rejected,
            self.check_failed,
            self.mkdir_failed,
            self.chown_failed,
            self.not_visible
        )
    }
}

pub struct Provisioner {
    fs: Arc<dyn FileSystem>,
    reporter: Arc<dyn Reporter>,
    home_prefix: String,
    min_uid: u32,
    max_uid: u32,
}

impl Provisioner {
    pub fn new(fs: Arc<dyn FileSystem>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            fs,
            reporter,
            home_prefix: "/user".to_string(),
            min_uid: 500,
            max_uid: 65_534,
        }
    }

    pub fn home_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.home_prefix = prefix.into();
        self
    }

    /// Both bounds are exclusive.
    pub fn uid_bounds(mut self, min_uid: u32, max_uid: u32) -> Self {
        self.min_uid = min_uid;
        self.max_uid = max_uid;
        self
    }

    pub fn home_dir(&self, username: &str) -> String {
        format!("{}/{}", self.home_prefix.trim_end_matches('/'), username)
    }

    fn is_regular(&self, uid: u32) -> bool {
        self.min_uid < uid && uid < self.max_uid
    }

    /// Provisions every regular account in ascending username order.
    pub async fn run(&self, records: Vec<IdentityRecord>) -> ProvisionReport {
        let mut records = records;
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records.dedup_by(|next, first| next.username == first.username);

        let mut report = ProvisionReport::default();
        for record in &records {
            if !self.is_regular(record.uid) {
                self.reporter.report(AuditEvent::ReservedUid {
                    username: record.username.clone(),
                    uid: record.uid,
                });
                report.reserved += 1;
                continue;
            }
            if !is_safe_username(&record.username) {
                self.reporter.report(AuditEvent::UnsafeUsername {
                    username: record.username.clone(),
                });
                report.rejected += 1;
                continue;
            }
            self.provision(record, &mut report).await;
        }
        report
    }

    async fn provision(&self, record: &IdentityRecord, report: &mut ProvisionReport) {
        let home = self.home_dir(&record.username);
        match self.fs.exists(&home).await {
            Ok(false) => {}
            Ok(true) => {
                self.reporter.report(AuditEvent::HomeExists {
                    username: record.username.clone(),
                });
                report.existing += 1;
                return;
            }
            Err(e) => {
                self.reporter.report(AuditEvent::HomeCheckFailed {
                    path: home,
                    reason: e.to_string(),
                });
                report.check_failed += 1;
                return;
            }
        }

        let paths = [home.clone()];
        let created = self.fs.mkdir(&paths).await.into_iter().next();
        match created {
            Some(result) if result.success => {
                self.reporter.report(AuditEvent::HomeCreated { path: home.clone() });
                report.created += 1;
            }
            other => {
                let reason = other
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "no result returned".to_string());
                self.reporter.report(AuditEvent::MkdirFailed { path: home, reason });
                report.mkdir_failed += 1;
                return;
            }
        }

        // ownership failure leaves the directory in place
        let owned = self.fs.chown(&paths, &record.username).await.into_iter().next();
        match owned {
            Some(result) if result.success => self.reporter.report(AuditEvent::Chowned {
                path: home.clone(),
                owner: record.username.clone(),
            }),
            other => {
                let reason = other
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "no result returned".to_string());
                self.reporter.report(AuditEvent::ChownFailed {
                    path: home.clone(),
                    owner: record.username.clone(),
                    reason,
                });
                report.chown_failed += 1;
            }
        }

        match self.fs.exists(&home).await {
            Ok(true) => self.reporter.report(AuditEvent::HomeVisible { path: home }),
            Ok(false) => {
                self.reporter.report(AuditEvent::HomeNotVisible { path: home });
                report.not_visible += 1;
            }
            Err(e) => {
                tracing::debug!("visibility check of {} failed: {}", home, e);
                self.reporter.report(AuditEvent::HomeNotVisible { path: home });
                report.not_visible += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testkit::{FsCall, MemoryFs, RecordingReporter, ScriptedRunner};

    fn user(name: &str, uid: u32) -> IdentityRecord {
        IdentityRecord {
            username: name.to_string(),
            uid,
            source: IdentityOrigin::Local,
        }
    }

    fn provisioner(fs: &Arc<MemoryFs>, reporter: &Arc<RecordingReporter>) -> Provisioner {
        Provisioner::new(fs.clone(), reporter.clone())
    }

    #[test]
    fn passwd_line_parsing() {
        assert_eq!(
            parse_passwd_line("alice:x:1001:1001:Alice:/home/alice:/bin/bash"),
            Some(("alice", 1001))
        );
        assert_eq!(parse_passwd_line("broken:x:notanumber:1"), None);
        assert_eq!(parse_passwd_line("#comment:x:1:1"), None);
        assert_eq!(parse_passwd_line(""), None);
    }

    #[tokio::test]
    async fn passwd_source_tags_local_and_directory_accounts() {
        let mut passwd = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut passwd,
            b"root:x:0:0:root:/root:/bin/bash\nalice:x:1001:1001::/home/alice:/bin/bash\n",
        )
        .unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "getent passwd",
            CommandOutput::ok(
                "root:x:0:0:root:/root:/bin/bash\n\
                 alice:x:1001:1001::/home/alice:/bin/bash\n\
                 bob:*:20001:20001:Bob:/home/bob:/bin/zsh\n",
            ),
        );
        let source = PasswdSource::new(runner, passwd.path());
        let records = source.records().await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].source, IdentityOrigin::Local);
        assert_eq!(records[2].username, "bob");
        assert_eq!(records[2].uid, 20001);
        assert_eq!(records[2].source, IdentityOrigin::Directory);
    }

    #[tokio::test]
    async fn passwd_source_failure_is_configuration_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("getent passwd", CommandOutput::failed(2, ""));
        let err = PasswdSource::new(runner, "/etc/passwd").records().await.unwrap_err();
        assert!(matches!(err, MaintError::Configuration(_)));
    }

    #[tokio::test]
    async fn reserved_uids_are_skipped_at_both_ends() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![
                user("daemon", 2),
                user("edge-low", 500),
                user("first", 501),
                user("last", 65_533),
                user("nobody", 65_534),
                user("nfsnobody", 4_294_967_294),
            ])
            .await;

        assert_eq!(report.created, 2);
        assert_eq!(report.reserved, 4);
        assert!(fs.contains("/user/first"));
        assert!(fs.contains("/user/last"));
        assert!(!fs.contains("/user/nobody"));
        assert!(!fs.contains("/user/edge-low"));
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        let users = vec![user("carol", 1003), user("alice", 1001)];
        let prov = provisioner(&fs, &reporter);

        let first = prov.run(users.clone()).await;
        assert_eq!(first.created, 2);
        assert_eq!(fs.owner("/user/alice").as_deref(), Some("alice"));
        let mutating = |c: &FsCall| matches!(c, FsCall::Mkdir(_) | FsCall::Chown { .. });
        assert_eq!(fs.count(mutating), 4);

        let second = prov.run(users).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.existing, 2);
        assert_eq!(fs.count(mutating), 4);
    }

    #[tokio::test]
    async fn users_are_processed_in_username_order() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        provisioner(&fs, &reporter)
            .run(vec![user("zed", 2000), user("amy", 2001), user("mo", 2002)])
            .await;

        let order: Vec<String> = fs
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                FsCall::Mkdir(paths) => paths.into_iter().next(),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["/user/amy", "/user/mo", "/user/zed"]);
    }

    #[tokio::test]
    async fn duplicate_usernames_are_provisioned_once() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        let mut dup = user("alice", 1001);
        dup.source = IdentityOrigin::Directory;
        let report = provisioner(&fs, &reporter)
            .run(vec![user("alice", 1001), dup])
            .await;
        assert_eq!(report.created, 1);
        assert_eq!(report.existing, 0);
    }

    #[tokio::test]
    async fn chown_failure_keeps_directory_and_continues() {
        let fs = Arc::new(MemoryFs::new().fail_chown("/user/alice"));
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![user("alice", 1001), user("bob", 1002)])
            .await;

        assert_eq!(report.created, 2);
        assert_eq!(report.chown_failed, 1);
        assert!(fs.contains("/user/alice"));
        assert_eq!(fs.owner("/user/alice"), None);
        assert_eq!(fs.owner("/user/bob").as_deref(), Some("bob"));
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::ChownFailed { path, .. } if path == "/user/alice")));
    }

    #[tokio::test]
    async fn mkdir_failure_skips_chown_and_continues() {
        let fs = Arc::new(MemoryFs::new().fail_mkdir("/user/alice"));
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![user("alice", 1001), user("bob", 1002)])
            .await;

        assert_eq!(report.mkdir_failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(fs.count(|c| matches!(c, FsCall::Chown { .. })), 1);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn invisible_directory_is_reported_not_escalated() {
        let fs = Arc::new(MemoryFs::new().invisible("/user/alice"));
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![user("alice", 1001)])
            .await;
        assert_eq!(report.created, 1);
        assert_eq!(report.not_visible, 1);
        assert!(reporter
            .events()
            .contains(&AuditEvent::HomeNotVisible { path: "/user/alice".into() }));
    }

    #[tokio::test]
    async fn failed_existence_check_is_per_user() {
        let fs = Arc::new(MemoryFs::new().unreachable("/user/alice"));
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![user("alice", 1001), user("bob", 1002)])
            .await;
        assert_eq!(report.check_failed, 1);
        assert_eq!(report.created, 1);
        assert!(fs.contains("/user/bob"));
    }

    #[tokio::test]
    async fn unsafe_usernames_never_reach_the_filesystem() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .run(vec![
                user("..", 1001),
                user("evil/../../etc", 1002),
                user(".", 1003),
                user("alice", 1004),
            ])
            .await;

        assert_eq!(report.rejected, 3);
        assert_eq!(report.created, 1);
        let alice = vec!["/user/alice".to_string()];
        assert!(fs.calls().iter().all(|c| match c {
            FsCall::Exists(path) => path == "/user/alice",
            FsCall::Mkdir(paths) | FsCall::Chown { paths, .. } => *paths == alice,
            _ => false,
        }));
        assert!(fs.contains("/user/alice"));
        assert!(reporter
            .events()
            .contains(&AuditEvent::UnsafeUsername { username: "..".into() }));
    }

    #[test]
    fn home_dir_respects_prefix() {
        let fs = Arc::new(MemoryFs::new());
        let prov = Provisioner::new(fs, Arc::new(RecordingReporter::new())).home_prefix("/home/");
        assert_eq!(prov.home_dir("alice"), "/home/alice");
    }

    #[tokio::test]
    async fn custom_uid_bounds() {
        let fs = Arc::new(MemoryFs::new());
        let reporter = Arc::new(RecordingReporter::new());
        let report = provisioner(&fs, &reporter)
            .uid_bounds(999, 60_000)
            .run(vec![user("svc", 999), user("alice", 1000), user("big", 60_000)])
            .await;
        assert_eq!(report.created, 1);
        assert_eq!(report.reserved, 2);
    }
}
