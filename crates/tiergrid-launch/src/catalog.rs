//! Entity type catalog.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tiergrid_entity::EntityBlueprint;

use crate::process::{
    CREATION_SCRIPT_URL, DATASTORE_PORT, HTTPS, HTTPS_PORT, HTTP_PORT, PROXY_HTTP_PORT,
    ProcessKind, SoftwareProcess, WAR,
};

/// The entity types a topology may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Root of a deployment; no behaviour of its own.
    Application,
    /// A plain container for sensors and children.
    Basic,
    SoftwareProcess,
    WebServer,
    DatabaseNode,
    /// Front end of a cluster.
    LoadBalancer,
    /// A resizable group built from a member template.
    DynamicCluster,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Application,
        EntityKind::Basic,
        EntityKind::SoftwareProcess,
        EntityKind::WebServer,
        EntityKind::DatabaseNode,
        EntityKind::LoadBalancer,
        EntityKind::DynamicCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Application => "application",
            EntityKind::Basic => "basic",
            EntityKind::SoftwareProcess => "software-process",
            EntityKind::WebServer => "web-server",
            EntityKind::DatabaseNode => "database-node",
            EntityKind::LoadBalancer => "load-balancer",
            EntityKind::DynamicCluster => "dynamic-cluster",
        }
    }

    /// Blueprint with this kind's declared keys and behaviours.
    ///
    /// A dynamic cluster needs a member factory, so the builder creates its
    /// blueprint; here it gets none.
    pub fn blueprint(self) -> EntityBlueprint {
        let blueprint = EntityBlueprint::new(self.as_str());
        match self {
            EntityKind::Application | EntityKind::Basic | EntityKind::DynamicCluster => blueprint,
            EntityKind::SoftwareProcess => {
                blueprint.with_startable(Arc::new(SoftwareProcess::new(ProcessKind::Generic)))
            }
            EntityKind::WebServer => blueprint
                .declare(&HTTP_PORT)
                .declare(&HTTPS_PORT)
                .declare(&HTTPS)
                .declare(&WAR)
                .with_startable(Arc::new(SoftwareProcess::new(ProcessKind::WebServer))),
            EntityKind::DatabaseNode => blueprint
                .declare(&DATASTORE_PORT)
                .declare(&CREATION_SCRIPT_URL)
                .with_startable(Arc::new(SoftwareProcess::new(ProcessKind::Database))),
            EntityKind::LoadBalancer => blueprint
                .declare(&PROXY_HTTP_PORT)
                .with_startable(Arc::new(SoftwareProcess::new(ProcessKind::LoadBalancer))),
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiergrid_entity::{Capability, OrchestrationContext};

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>(), Ok(kind));
        }
        assert_eq!("nginx".parse::<EntityKind>(), Err("nginx".to_string()));
    }

    #[test]
    fn process_kinds_are_startable() {
        let ctx = OrchestrationContext::new();
        let web = ctx.create_entity(EntityKind::WebServer.blueprint()).unwrap();
        assert!(web.has_capability(Capability::Startable));
        assert_eq!(web.config(&HTTP_PORT).unwrap().start(), 8080);

        let app = ctx.create_entity(EntityKind::Application.blueprint()).unwrap();
        assert!(!app.has_capability(Capability::Startable));
        assert_eq!(app.entity_type(), "application");
    }
}
