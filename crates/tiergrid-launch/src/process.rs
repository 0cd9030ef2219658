//! Simulated software processes.
//!
//! A `SoftwareProcess` provisions a machine from the entity's location,
//! claims the ports named by its `*.port` configuration and publishes where
//! it can be reached. Nothing is actually installed or run.
//!
//! A web server serves `https` instead of `http` when `app.https` is set on
//! it or any ancestor. A load balancer is the front end of a cluster: its
//! `main.uri` is the address clients use, and its `proxy.targets` sensor is
//! fed the cluster members' URIs by a `list` aggregation.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tiergrid_core::PortRange;
use tiergrid_entity::sensor::{DATASTORE_URL, HOST_ADDRESS, MAIN_URI};
use tiergrid_entity::{
    ConfigKey, Entity, EntityError, EntityResult, Location, Machine, PortRequest,
    ProvisionRequest, Provisioner, Sensor, Startable,
};
use tracing::{debug, info};

pub static HTTP_PORT: LazyLock<ConfigKey<PortRange>> = LazyLock::new(|| {
    ConfigKey::new("http.port", "Ports the web server may listen on")
        .with_default(PortRange::open(8080))
});

pub static HTTPS_PORT: LazyLock<ConfigKey<PortRange>> = LazyLock::new(|| {
    ConfigKey::new("https.port", "Ports the web server may listen on for https")
        .with_default(PortRange::open(8443))
});

pub static HTTPS: LazyLock<ConfigKey<bool>> = LazyLock::new(|| {
    ConfigKey::new("app.https", "Serve https instead of http").with_default(false)
});

pub static PROXY_HTTP_PORT: LazyLock<ConfigKey<PortRange>> = LazyLock::new(|| {
    ConfigKey::new("proxy.http.port", "Ports the load balancer may listen on")
        .with_default(PortRange::open(8000))
});

pub static DATASTORE_PORT: LazyLock<ConfigKey<PortRange>> = LazyLock::new(|| {
    ConfigKey::new("mysql.port", "Ports the database may listen on")
        .with_default(PortRange::open(3306))
});

pub static WAR: LazyLock<ConfigKey<String>> =
    LazyLock::new(|| ConfigKey::new("war", "Archive the web server serves"));

pub static CREATION_SCRIPT_URL: LazyLock<ConfigKey<String>> = LazyLock::new(|| {
    ConfigKey::new("creation.script.url", "Script run when the database is created")
});

pub const REQUESTS_PER_SECOND: Sensor<f64> =
    Sensor::new("http.requests.per_second", "Requests served per second");

pub const ENABLED_PROTOCOLS: Sensor<Vec<String>> =
    Sensor::new("webapp.enabled_protocols", "Protocols the web server accepts");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Generic,
    WebServer,
    Database,
    LoadBalancer,
}

pub struct SoftwareProcess {
    kind: ProcessKind,
    machine: Mutex<Option<(Arc<dyn Provisioner>, Machine)>>,
}

impl SoftwareProcess {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            machine: Mutex::new(None),
        }
    }

    pub fn machine(&self) -> Option<Machine> {
        self.machine.lock().as_ref().map(|(_, m)| m.clone())
    }

    fn ports(&self, entity: &Entity) -> BTreeMap<String, PortRange> {
        let mut ports = BTreeMap::new();
        let typed = match self.kind {
            ProcessKind::WebServer if serves_https(entity) => Some(&*HTTPS_PORT),
            ProcessKind::WebServer => Some(&*HTTP_PORT),
            ProcessKind::Database => Some(&*DATASTORE_PORT),
            ProcessKind::LoadBalancer => Some(&*PROXY_HTTP_PORT),
            ProcessKind::Generic => None,
        };
        if let Some(key) = typed
            && let Some(range) = entity.config(key)
        {
            ports.insert(key.name().to_string(), range);
        }
        for (key, value) in entity.own_config() {
            if key.ends_with(".port")
                && !ports.contains_key(&key)
                && let Ok(range) = PortRange::from_value(&value)
            {
                ports.insert(key, range);
            }
        }
        ports
    }

    fn publish(&self, entity: &Entity, machine: &Machine) {
        entity.set_sensor(&HOST_ADDRESS, machine.address.clone());
        for (name, port) in &machine.ports {
            entity.set_sensor(&Sensor::<u16>::named(name.clone()), *port);
        }
        match self.kind {
            ProcessKind::WebServer => {
                let (scheme, key) = if serves_https(entity) {
                    ("https", &*HTTPS_PORT)
                } else {
                    ("http", &*HTTP_PORT)
                };
                entity.set_sensor(&ENABLED_PROTOCOLS, vec![scheme.to_string()]);
                if let Some(port) = machine.ports.get(key.name()) {
                    entity.set_sensor(&MAIN_URI, format!("{scheme}://{}:{port}/", machine.address));
                }
                if let Some(war) = entity.config(&WAR) {
                    info!(entity = %entity.id(), war = %war, "serving archive");
                }
                entity.set_sensor(&REQUESTS_PER_SECOND, 0.0);
            }
            ProcessKind::Database => {
                if let Some(script) = entity.config(&CREATION_SCRIPT_URL) {
                    info!(entity = %entity.id(), script = %script, "running creation script");
                }
                if let Some(port) = machine.ports.get(DATASTORE_PORT.name()) {
                    entity.set_sensor(
                        &DATASTORE_URL,
                        format!("mysql://{}:{port}/", machine.address),
                    );
                }
            }
            ProcessKind::LoadBalancer => {
                if let Some(port) = machine.ports.get(PROXY_HTTP_PORT.name()) {
                    entity.set_sensor(&MAIN_URI, format!("http://{}:{port}/", machine.address));
                }
            }
            ProcessKind::Generic => {}
        }
    }
}

fn serves_https(entity: &Entity) -> bool {
    entity.config(&HTTPS).unwrap_or(false)
}

#[async_trait]
impl Startable for SoftwareProcess {
    async fn start(&self, entity: &Arc<Entity>, location: &Location) -> EntityResult<()> {
        let request = ProvisionRequest {
            entity: entity.id(),
            entity_type: entity.entity_type().to_string(),
            ports: self
                .ports(entity)
                .into_iter()
                .map(|(name, range)| PortRequest { name, range })
                .collect(),
        };
        let machine = location
            .provisioner
            .provision(&request)
            .await
            .map_err(|e| EntityError::Provisioning {
                entity: entity.label(),
                reason: e.to_string(),
            })?;
        if entity.is_shutting_down() {
            location.provisioner.release(&machine).await;
            return Err(EntityError::Cancelled {
                entity: entity.label(),
            });
        }

        debug!(entity = %entity.id(), machine = %machine.id, "machine provisioned");
        self.publish(entity, &machine);
        *self.machine.lock() = Some((Arc::clone(&location.provisioner), machine));
        Ok(())
    }

    async fn stop(&self, entity: &Arc<Entity>) -> EntityResult<()> {
        let held = self.machine.lock().take();
        if let Some((provisioner, machine)) = held {
            provisioner.release(&machine).await;
            debug!(entity = %entity.id(), machine = %machine.id, "machine released");
        }
        Ok(())
    }
}
