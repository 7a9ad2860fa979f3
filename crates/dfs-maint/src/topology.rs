//! Cluster topology collaborator: which metadata servers exist, what role
//! each one currently holds and where it publishes its RPC endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MaintError, Result};
use crate::exec::{display_command, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceRole {
    Active,
    Standby,
    Unknown,
}

impl ServiceRole {
    /// Parses a role as printed by `haadmin -getServiceState`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => ServiceRole::Active,
            "standby" => ServiceRole::Standby,
            _ => ServiceRole::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceRole::Active)
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceRole::Active => "active",
            ServiceRole::Standby => "standby",
            ServiceRole::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A metadata server together with the role it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataServer {
    pub name: String,
    pub role: ServiceRole,
}

/// Cluster name plus its metadata servers, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub cluster: String,
    pub servers: Vec<String>,
}

#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Reads the cluster name and server identifiers.
    async fn topology(&self) -> Result<ClusterTopology>;

    /// Queries the current role of one server.
    async fn service_role(&self, cluster: &str, server: &str) -> Result<ServiceRole>;

    /// Returns the published `host:port` RPC address of one server.
    async fn server_address(&self, cluster: &str, server: &str) -> Result<String>;
}

/// [`TopologySource`] backed by `hdfs getconf` and `hdfs haadmin`.
pub struct HdfsGetconf {
    runner: Arc<dyn CommandRunner>,
    hdfs_bin: String,
    nameservice: Option<String>,
}

impl HdfsGetconf {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        hdfs_bin: impl Into<String>,
        nameservice: Option<String>,
    ) -> Self {
        Self {
            runner,
            hdfs_bin: hdfs_bin.into(),
            nameservice,
        }
    }

    async fn conf_key(&self, key: &str) -> Result<String> {
        let args = vec!["getconf".to_string(), "-confKey".to_string(), key.to_string()];
        let out = self
            .runner
            .run(&self.hdfs_bin, &args)
            .await
            .map_err(|e| MaintError::Configuration(e.to_string()))?;
        let value = out.first_line();
        if !out.success() || value.is_empty() {
            return Err(MaintError::Configuration(format!(
                "`{}` returned no value: {}",
                display_command(&self.hdfs_bin, &args),
                out.failure_reason()
            )));
        }
        Ok(value.to_string())
    }

    async fn cluster_name(&self) -> Result<String> {
        if let Some(ref ns) = self.nameservice {
            return Ok(ns.clone());
        }
        let raw = self.conf_key("dfs.nameservices").await?;
        let names: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        match names.as_slice() {
            [single] => Ok(single.to_string()),
            _ => Err(MaintError::Configuration(format!(
                "expected one nameservice, found {:?}; set `nameservice` in the config",
                names
            ))),
        }
    }
}

#[async_trait]
impl TopologySource for HdfsGetconf {
    async fn topology(&self) -> Result<ClusterTopology> {
        let cluster = self.cluster_name().await?;
        let raw = self
            .conf_key(&format!("dfs.ha.namenodes.{}", cluster))
            .await?;
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            return Err(MaintError::Configuration(format!(
                "no metadata servers configured for {}",
                cluster
            )));
        }
        Ok(ClusterTopology { cluster, servers })
    }

    async fn service_role(&self, _cluster: &str, server: &str) -> Result<ServiceRole> {
        let args = vec![
            "haadmin".to_string(),
            "-getServiceState".to_string(),
            server.to_string(),
        ];
        let out = self.runner.run(&self.hdfs_bin, &args).await?;
        if !out.success() {
            return Err(MaintError::Command {
                command: display_command(&self.hdfs_bin, &args),
                reason: out.failure_reason(),
            });
        }
        Ok(ServiceRole::parse(out.first_line()))
    }

    async fn server_address(&self, cluster: &str, server: &str) -> Result<String> {
        self.conf_key(&format!("dfs.namenode.rpc-address.{}.{}", cluster, server))
            .await
    }
}
