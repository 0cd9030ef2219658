//! `Launcher` and the running `Deployment` it produces.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tiergrid_autoscale::PolicyHandle;
use tiergrid_core::{LocationSpec, PortRange, TopologySpec};
use tiergrid_enrich::EnricherHandle;
use tiergrid_entity::{
    Entity, LocalhostProvisioner, Location, OrchestrationContext, Provisioner, TreeSnapshot,
};
use tracing::{info, warn};

use crate::build::{build_tree, BuiltTree};
use crate::error::{LaunchError, LaunchResult};

pub const DEFAULT_LOCATION: &str = "localhost";
pub const DEFAULT_PORT: &str = "8081+";

/// Builds and starts a topology.
///
/// Command-line overrides win over the topology's `[launch]` section,
/// which wins over the defaults.
pub struct Launcher {
    topology: TopologySpec,
    location: Option<String>,
    port: Option<String>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl Launcher {
    pub fn new(topology: TopologySpec) -> Self {
        Self {
            topology,
            location: None,
            port: None,
            provisioner: None,
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let topology = TopologySpec::from_file(path)
            .with_context(|| format!("loading topology {}", path.display()))?;
        Ok(Self::new(topology))
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Management port range, e.g. `8081+`.
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Provision localhost machines through `provisioner` instead of a
    /// fresh unlimited one.
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn topology(&self) -> &TopologySpec {
        &self.topology
    }

    fn resolve_location(&self) -> LaunchResult<Location> {
        let text = self
            .location
            .as_deref()
            .or(self.topology.launch.location.as_deref())
            .unwrap_or(DEFAULT_LOCATION);
        match LocationSpec::parse(text)? {
            spec @ LocationSpec::Localhost => {
                let provisioner = self
                    .provisioner
                    .clone()
                    .unwrap_or_else(|| Arc::new(LocalhostProvisioner::new()));
                Ok(Location::new(spec, provisioner))
            }
            LocationSpec::Cloud { .. } => Err(LaunchError::UnsupportedLocation(text.to_string())),
        }
    }

    fn management_ports(&self) -> LaunchResult<PortRange> {
        let text = self
            .port
            .as_deref()
            .or(self.topology.launch.port.as_deref())
            .unwrap_or(DEFAULT_PORT);
        Ok(text.parse()?)
    }

    /// Build the tree without starting it.
    pub fn build(self) -> LaunchResult<Deployment> {
        let management = self.management_ports()?;
        let ctx = OrchestrationContext::new();
        let built = build_tree(&ctx, &self.topology)?;
        Ok(Deployment::new(
            self.topology.display_name().to_string(),
            ctx,
            built,
            management,
        ))
    }

    /// Build the tree and start it.
    ///
    /// Only a failure of the root entity fails the launch; the partly
    /// started tree is stopped before the error is returned.
    pub async fn launch(self) -> LaunchResult<Deployment> {
        let location = self.resolve_location()?;
        let deployment = self.build()?;
        info!(
            application = %deployment.name,
            location = %location.spec,
            management = %deployment.management,
            "launching"
        );

        if let Err(e) = deployment.root.start(location).await {
            let entity = e
                .entity()
                .map(str::to_string)
                .unwrap_or_else(|| deployment.root.label());
            let reason = e.to_string();
            if let Err(stop) = deployment.stop().await {
                warn!(error = %stop, "cleanup after failed launch failed");
            }
            return Err(LaunchError::Start { entity, reason });
        }
        info!(application = %deployment.name, "launched");
        Ok(deployment)
    }
}

/// A built (and usually running) topology.
pub struct Deployment {
    name: String,
    ctx: OrchestrationContext,
    root: Arc<Entity>,
    management: PortRange,
    enrichers: Vec<EnricherHandle>,
    policies: Vec<PolicyHandle>,
}

impl Deployment {
    fn new(name: String, ctx: OrchestrationContext, built: BuiltTree, management: PortRange) -> Self {
        Self {
            name,
            ctx,
            root: built.root,
            management,
            enrichers: built.enrichers,
            policies: built.policies,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Arc<Entity> {
        &self.root
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.ctx
    }

    pub fn management_ports(&self) -> PortRange {
        self.management
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.ctx.dump(&self.root)
    }

    /// Human-readable dump of the live tree.
    pub fn dump(&self) -> String {
        self.snapshot().to_string()
    }

    /// Detach policies, stop the tree (children first, in reverse order)
    /// and release everything it held.
    pub async fn stop(self) -> LaunchResult<()> {
        for policy in self.policies {
            policy.detach();
        }
        info!(application = %self.name, "stopping");
        self.root.stop().await?;
        for enricher in self.enrichers {
            enricher.detach();
        }
        self.ctx.unmanage(&self.root);
        info!(application = %self.name, "stopped");
        Ok(())
    }
}
