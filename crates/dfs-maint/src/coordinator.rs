//! Active-coordinator resolution.
//!
//! Retention and provisioning mutate the shared namespace and must run on
//! exactly one node of an HA pair. Both flows pass through
//! [`CoordinatorGate::check`], which finds the active metadata server and
//! lets the run proceed only when this host is that server. Losing the gate
//! is a normal outcome, not an error.
//!
//! The gate is advisory: a failover between resolution and action is not
//! guarded against.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{MaintError, Result};
use crate::exec::CommandRunner;
use crate::report::{AuditEvent, Reporter};
use crate::topology::{ClusterTopology, MetadataServer, ServiceRole, TopologySource};

/// The metadata server that reported itself active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveServer {
    pub cluster: String,
    pub name: String,
}

/// No server in the topology reported `active`.
#[derive(Debug, Clone, Error)]
#[error("no active metadata server in {cluster}")]
pub struct NoActiveFound {
    pub cluster: String,
    /// Every server queried, with the role it was taken to hold.
    pub observed: Vec<MetadataServer>,
}

/// Queries servers in topology order and stops at the first active one.
///
/// A server whose role query fails is treated as standby.
pub async fn resolve_active(
    source: &dyn TopologySource,
    topology: &ClusterTopology,
    reporter: &dyn Reporter,
) -> std::result::Result<ActiveServer, NoActiveFound> {
    let mut observed = Vec::with_capacity(topology.servers.len());

    for server in &topology.servers {
        let role = match source.service_role(&topology.cluster, server).await {
            Ok(role) => {
                reporter.report(AuditEvent::ServerRole {
                    server: server.clone(),
                    role,
                });
                role
            }
            Err(e) => {
                reporter.report(AuditEvent::ServerUnreachable {
                    server: server.clone(),
                    reason: e.to_string(),
                });
                ServiceRole::Standby
            }
        };

        if role.is_active() {
            return Ok(ActiveServer {
                cluster: topology.cluster.clone(),
                name: server.clone(),
            });
        }
        observed.push(MetadataServer {
            name: server.clone(),
            role,
        });
    }

    Err(NoActiveFound {
        cluster: topology.cluster.clone(),
        observed,
    })
}

/// Host part of a published `host:port` address.
pub fn host_of(address: &str) -> &str {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => address,
    }
}

pub fn is_local_host(active_host: &str, local_host: &str) -> bool {
    active_host == local_host
}

/// Fully qualified name of this host: the configured override, else
/// `hostname -f`, else the kernel hostname.
pub async fn local_hostname(
    runner: &dyn CommandRunner,
    hostname_bin: &str,
    configured: Option<&str>,
) -> String {
    if let Some(name) = configured {
        return name.to_string();
    }
    match runner.run(hostname_bin, &["-f".to_string()]).await {
        Ok(out) if out.success() && !out.first_line().is_empty() => out.first_line().to_string(),
        Ok(out) => {
            tracing::debug!("hostname -f failed: {}", out.failure_reason());
            gethostname::gethostname().to_string_lossy().into_owned()
        }
        Err(e) => {
            tracing::debug!("hostname -f failed: {}", e);
            gethostname::gethostname().to_string_lossy().into_owned()
        }
    }
}

/// Active server with its resolved host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveHost {
    pub server: ActiveServer,
    pub address: String,
    pub host: String,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    /// This host is the active coordinator.
    Authoritative(ActiveHost),
    /// Another host is active.
    NotAuthoritative { active: ActiveHost, local_host: String },
    NoActive(NoActiveFound),
}

impl GateDecision {
    pub fn is_authoritative(&self) -> bool {
        matches!(self, GateDecision::Authoritative(_))
    }
}

pub struct CoordinatorGate {
    source: Arc<dyn TopologySource>,
    reporter: Arc<dyn Reporter>,
    local_host: String,
}

impl CoordinatorGate {
    pub fn new(
        source: Arc<dyn TopologySource>,
        reporter: Arc<dyn Reporter>,
        local_host: impl Into<String>,
    ) -> Self {
        Self {
            source,
            reporter,
            local_host: local_host.into(),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Resolves the active server and compares it with this host.
    ///
    /// Fails only when the topology itself cannot be read or the active
    /// server's address cannot be looked up.
    pub async fn check(&self) -> Result<GateDecision> {
        let topology = self.source.topology().await?;
        tracing::info!("cluster name is {}", topology.cluster);

        let server =
            match resolve_active(self.source.as_ref(), &topology, self.reporter.as_ref()).await {
                Ok(server) => server,
                Err(none) => {
                    self.reporter.report(AuditEvent::NoActiveServer {
                        cluster: none.cluster.clone(),
                    });
                    return Ok(GateDecision::NoActive(none));
                }
            };

        let address = self
            .source
            .server_address(&server.cluster, &server.name)
            .await
            .map_err(|e| {
                MaintError::Configuration(format!("address of {}: {}", server.name, e))
            })?;
        let host = host_of(&address).to_string();
        let active = ActiveHost {
            server,
            address,
            host,
        };

        if is_local_host(&active.host, &self.local_host) {
            self.reporter.report(AuditEvent::Authoritative {
                server: active.server.name.clone(),
                host: active.host.clone(),
            });
            Ok(GateDecision::Authoritative(active))
        } else {
            self.reporter.report(AuditEvent::NotAuthoritative {
                active_host: active.host.clone(),
                local_host: self.local_host.clone(),
            });
            Ok(GateDecision::NotAuthoritative {
                active,
                local_host: self.local_host.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testkit::{RecordingReporter, ScriptedRunner, ScriptedTopology};

    fn topology(servers: &[&str]) -> ClusterTopology {
        ClusterTopology {
            cluster: "prod".to_string(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn stops_at_first_active_server() {
        let source = ScriptedTopology::new("prod")
            .server("a", ServiceRole::Standby, "a.example.com:8020")
            .server("b", ServiceRole::Active, "b.example.com:8020")
            .server("c", ServiceRole::Standby, "c.example.com:8020");
        let reporter = RecordingReporter::new();

        let active = resolve_active(&source, &topology(&["a", "b", "c"]), &reporter)
            .await
            .unwrap();
        assert_eq!(active.name, "b");
        assert_eq!(source.role_queries(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn all_standby_or_unreachable_is_no_active() {
        let source = ScriptedTopology::new("prod")
            .server("a", ServiceRole::Standby, "a:8020")
            .unreachable("b")
            .server("c", ServiceRole::Unknown, "c:8020");
        let reporter = RecordingReporter::new();

        let none = resolve_active(&source, &topology(&["a", "b", "c"]), &reporter)
            .await
            .unwrap_err();
        assert_eq!(none.cluster, "prod");
        let roles: Vec<ServiceRole> = none.observed.iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![ServiceRole::Standby, ServiceRole::Standby, ServiceRole::Unknown]
        );
        assert_eq!(source.role_queries(), vec!["a", "b", "c"]);
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::ServerUnreachable { server, .. } if server == "b")));
    }

    #[tokio::test]
    async fn unreachable_server_does_not_stop_resolution() {
        let source = ScriptedTopology::new("prod")
            .unreachable("a")
            .server("b", ServiceRole::Active, "b:8020");
        let reporter = RecordingReporter::new();
        let active = resolve_active(&source, &topology(&["a", "b"]), &reporter)
            .await
            .unwrap();
        assert_eq!(active.name, "b");
    }

    #[test]
    fn host_of_strips_port() {
        assert_eq!(host_of("nn1.example.com:8020"), "nn1.example.com");
        assert_eq!(host_of("nn1.example.com"), "nn1.example.com");
        assert_eq!(host_of("[fe80::1]:8020"), "fe80::1");
        assert_eq!(host_of(" nn2:8020\n"), "nn2");
    }

    #[test]
    fn local_host_comparison_is_exact() {
        assert!(is_local_host("nn1.example.com", "nn1.example.com"));
        assert!(!is_local_host("nn1.example.com", "nn1"));
        assert!(!is_local_host("NN1.example.com", "nn1.example.com"));
    }

    #[tokio::test]
    async fn gate_authorizes_only_the_active_host() {
        let source = Arc::new(
            ScriptedTopology::new("prod")
                .server("nn1", ServiceRole::Standby, "nn1.example.com:8020")
                .server("nn2", ServiceRole::Active, "nn2.example.com:8020"),
        );
        let reporter = Arc::new(RecordingReporter::new());

        let here = CoordinatorGate::new(source.clone(), reporter.clone(), "nn2.example.com");
        let decision = here.check().await.unwrap();
        assert!(decision.is_authoritative());

        let elsewhere = CoordinatorGate::new(source, reporter.clone(), "nn1.example.com");
        match elsewhere.check().await.unwrap() {
            GateDecision::NotAuthoritative { active, local_host } => {
                assert_eq!(active.host, "nn2.example.com");
                assert_eq!(local_host, "nn1.example.com");
            }
            other => panic!("expected NotAuthoritative, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn gate_reports_no_active() {
        let source = Arc::new(
            ScriptedTopology::new("prod").server("nn1", ServiceRole::Standby, "nn1:8020"),
        );
        let reporter = Arc::new(RecordingReporter::new());
        let gate = CoordinatorGate::new(source, reporter.clone(), "nn1");
        let decision = gate.check().await.unwrap();
        assert!(matches!(decision, GateDecision::NoActive(_)));
        assert!(reporter
            .events()
            .contains(&AuditEvent::NoActiveServer { cluster: "prod".into() }));
    }

    #[tokio::test]
    async fn gate_fails_when_topology_is_unreadable() {
        let source = Arc::new(ScriptedTopology::new("prod").broken());
        let gate = CoordinatorGate::new(source, Arc::new(RecordingReporter::new()), "nn1");
        let err = gate.check().await.unwrap_err();
        assert!(matches!(err, MaintError::Configuration(_)));
    }

    #[tokio::test]
    async fn local_hostname_prefers_override_then_command() {
        let runner = ScriptedRunner::new();
        runner.respond("hostname -f", CommandOutput::ok("nn1.example.com\n"));

        assert_eq!(
            local_hostname(&runner, "hostname", Some("pinned.example.com")).await,
            "pinned.example.com"
        );
        assert_eq!(
            local_hostname(&runner, "hostname", None).await,
            "nn1.example.com"
        );
    }

    #[tokio::test]
    async fn local_hostname_falls_back_to_kernel_name() {
        let runner = ScriptedRunner::new();
        let name = local_hostname(&runner, "hostname", None).await;
        assert_eq!(name, gethostname::gethostname().to_string_lossy());
    }
}
