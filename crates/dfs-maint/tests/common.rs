//! Shared fixtures for agent-level tests.

use std::sync::Arc;

use dfs_maint::cli::Agent;
use dfs_maint::exec::CommandOutput;
use dfs_maint::provision::{IdentityOrigin, IdentityRecord};
use dfs_maint::testkit::{MemoryFs, RecordingReporter, ScriptedRunner, ScriptedTopology, StaticIdentities};
use dfs_maint::topology::ServiceRole;
use dfs_maint::MaintConfig;

pub const ACTIVE_HOST: &str = "nn1.example.com";
pub const STANDBY_HOST: &str = "nn2.example.com";

/// An agent wired to in-memory collaborators, plus handles to inspect them.
pub struct Harness {
    pub agent: Agent,
    pub fs: Arc<MemoryFs>,
    pub runner: Arc<ScriptedRunner>,
    pub topology: Arc<ScriptedTopology>,
    pub reporter: Arc<RecordingReporter>,
}

/// Two-node pair with `nn1` active.
pub fn ha_pair() -> ScriptedTopology {
    ScriptedTopology::new("prod")
        .server("nn1", ServiceRole::Active, &format!("{}:8020", ACTIVE_HOST))
        .server("nn2", ServiceRole::Standby, &format!("{}:8020", STANDBY_HOST))
}

pub fn account(name: &str, uid: u32) -> IdentityRecord {
    IdentityRecord {
        username: name.to_string(),
        uid,
        source: IdentityOrigin::Directory,
    }
}

pub struct HarnessBuilder {
    fs: MemoryFs,
    topology: ScriptedTopology,
    identities: Option<Vec<IdentityRecord>>,
    config: MaintConfig,
    ticket: bool,
}

impl HarnessBuilder {
    pub fn new(fs: MemoryFs) -> Self {
        Self {
            fs,
            topology: ha_pair(),
            identities: Some(Vec::new()),
            config: MaintConfig {
                local_hostname: Some(ACTIVE_HOST.to_string()),
                ..MaintConfig::default()
            },
            ticket: true,
        }
    }

    pub fn topology(mut self, topology: ScriptedTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn local_host(mut self, host: &str) -> Self {
        self.config.local_hostname = Some(host.to_string());
        self
    }

    pub fn identities(mut self, records: Vec<IdentityRecord>) -> Self {
        self.identities = Some(records);
        self
    }

    /// The identity source cannot be enumerated.
    pub fn identities_unreachable(mut self) -> Self {
        self.identities = None;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut MaintConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn without_ticket(mut self) -> Self {
        self.ticket = false;
        self
    }

    pub fn build(self) -> Harness {
        let fs = Arc::new(self.fs);
        let runner = Arc::new(ScriptedRunner::new());
        if self.ticket {
            runner.respond("klist -s", CommandOutput::ok(""));
        } else {
            runner.respond("klist -s", CommandOutput::failed(1, ""));
        }
        let topology = Arc::new(self.topology);
        let reporter = Arc::new(RecordingReporter::new());

        let agent = Agent {
            config: self.config,
            runner: runner.clone(),
            fs: fs.clone(),
            topology: topology.clone(),
            identities: Arc::new(match self.identities {
                Some(records) => StaticIdentities::new(records),
                None => StaticIdentities::failing(),
            }),
            reporter: reporter.clone(),
        };
        Harness {
            agent,
            fs,
            runner,
            topology,
            reporter,
        }
    }
}
