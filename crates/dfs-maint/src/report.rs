//! Audit reporting.
//!
//! Components never log their decisions directly; they hand [`AuditEvent`]s
//! to an injected [`Reporter`]. Operators read the trail of a dry run before
//! committing a destructive one, so every skip, failure and success goes
//! through here with the affected path and the reason.

use serde::{Deserialize, Serialize};

use crate::topology::ServiceRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    ServerRole { server: String, role: ServiceRole },
    ServerUnreachable { server: String, reason: String },
    NoActiveServer { cluster: String },
    NotAuthoritative { active_host: String, local_host: String },
    Authoritative { server: String, host: String },

    RootNotFound { path: String },
    SkipProtected { path: String, rule: String },
    SkipTooNew { path: String, age_secs: i64 },
    SkipCovered { path: String, ancestor: String },
    WouldDelete { path: String, age_secs: i64 },
    Deleted { path: String },
    DeleteFailed { path: String, reason: String },
    DeleteUnverified { path: String },

    SizeFailed { path: String, reason: String },

    HomeExists { username: String },
    HomeCheckFailed { path: String, reason: String },
    ReservedUid { username: String, uid: u32 },
    UnsafeUsername { username: String },
    HomeCreated { path: String },
    MkdirFailed { path: String, reason: String },
    Chowned { path: String, owner: String },
    ChownFailed { path: String, owner: String, reason: String },
    HomeVisible { path: String },
    HomeNotVisible { path: String },
}

impl AuditEvent {
    pub fn severity(&self) -> Severity {
        use AuditEvent::*;
        match self {
            SkipTooNew { .. } | SkipCovered { .. } | HomeExists { .. } | ReservedUid { .. } => {
                Severity::Debug
            }
            ServerUnreachable { .. }
            | RootNotFound { .. }
            | DeleteFailed { .. }
            | DeleteUnverified { .. }
            | SizeFailed { .. }
            | HomeCheckFailed { .. }
            | UnsafeUsername { .. }
            | MkdirFailed { .. }
            | ChownFailed { .. }
            | HomeNotVisible { .. } => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use AuditEvent::*;
        match self {
            ServerRole { server, role } => write!(f, "{} is the {} node", server, role),
            ServerUnreachable { server, reason } => {
                write!(f, "{} did not report a role, treating as standby: {}", server, reason)
            }
            NoActiveServer { cluster } => write!(f, "no active metadata server in {}", cluster),
            NotAuthoritative {
                active_host,
                local_host,
            } => write!(
                f,
                "active node {} is not the current host {}, so bailing out",
                active_host, local_host
            ),
            Authoritative { server, host } => {
                write!(f, "active node is {} ({}), this host", host, server)
            }
            RootNotFound { path } => write!(f, "{} is not found", path),
            SkipProtected { path, rule } => {
                write!(f, "protected by rule {}, not deleting: {}", rule, path)
            }
            SkipTooNew { path, age_secs } => write!(f, "too new ({}s old): {}", age_secs, path),
            SkipCovered { path, ancestor } => {
                write!(f, "already covered by {}: {}", ancestor, path)
            }
            WouldDelete { path, age_secs } => {
                write!(f, "would delete ({}s old): {}", age_secs, path)
            }
            Deleted { path } => write!(f, "removed {}", path),
            DeleteFailed { path, reason } => write!(f, "could not delete {}: {}", path, reason),
            DeleteUnverified { path } => {
                write!(f, "{} still listed after delete, may be a stale read", path)
            }
            SizeFailed { path, reason } => write!(f, "could not size {}: {}", path, reason),
            HomeExists { username } => write!(f, "home directory exists for {}", username),
            HomeCheckFailed { path, reason } => write!(f, "could not check {}: {}", path, reason),
            ReservedUid { username, uid } => {
                write!(f, "skipping {} with reserved uid {}", username, uid)
            }
            UnsafeUsername { username } => {
                write!(f, "skipping account {:?}, not usable as a directory name", username)
            }
            HomeCreated { path } => write!(f, "created {}", path),
            MkdirFailed { path, reason } => write!(f, "could not create {}: {}", path, reason),
            Chowned { path, owner } => write!(f, "chowned {} to {}", path, owner),
            ChownFailed {
                path,
                owner,
                reason,
            } => write!(f, "could not chown {} to {}: {}", path, owner, reason),
            HomeVisible { path } => write!(f, "{} ... created", path),
            HomeNotVisible { path } => write!(f, "{} not visible after creation", path),
        }
    }
}

/// Sink for audit events.
pub trait Reporter: Send + Sync {
    fn report(&self, event: AuditEvent);
}

/// Forwards audit events to `tracing` at their severity.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: AuditEvent) {
        match event.severity() {
            Severity::Debug => tracing::debug!("{}", event),
            Severity::Info => tracing::info!("{}", event),
            Severity::Warn => tracing::warn!("{}", event),
        }
    }
}
