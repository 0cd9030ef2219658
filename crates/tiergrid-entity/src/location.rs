//! Locations and the provisioning seam.
//!
//! A `Location` pairs a parsed location spec with the `Provisioner` that
//! turns "a machine for entity X" into an addressable machine. Only the
//! simulated localhost provisioner ships with tiergrid.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tiergrid_core::{LocationSpec, PortRange};
use tracing::debug;

use crate::types::EntityId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProvisioningError {
    #[error("location exhausted: {0}")]
    Exhausted(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("provisioner unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct PortRequest {
    pub name: String,
    pub range: PortRange,
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub entity: EntityId,
    pub entity_type: String,
    pub ports: Vec<PortRequest>,
}

/// A provisioned, addressable machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub id: String,
    pub address: String,
    pub ports: BTreeMap<String, u16>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Machine, ProvisioningError>;

    async fn release(&self, machine: &Machine);
}

#[derive(Clone)]
pub struct Location {
    pub spec: LocationSpec,
    pub provisioner: Arc<dyn Provisioner>,
}

impl Location {
    pub fn new(spec: LocationSpec, provisioner: Arc<dyn Provisioner>) -> Self {
        Self { spec, provisioner }
    }

    pub fn localhost() -> Self {
        Self::new(
            LocationSpec::Localhost,
            Arc::new(LocalhostProvisioner::new()),
        )
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({})", self.spec)
    }
}

#[derive(Default)]
struct Allocations {
    ports: HashSet<u16>,
    machines: BTreeMap<String, Vec<u16>>,
}

/// Simulated provisioner: every machine is `127.0.0.1`, ports are allocated
/// from the requested ranges without reuse while a machine holds them.
pub struct LocalhostProvisioner {
    next_machine: AtomicU64,
    max_machines: Option<usize>,
    state: Mutex<Allocations>,
}

impl LocalhostProvisioner {
    pub fn new() -> Self {
        Self {
            next_machine: AtomicU64::new(0),
            max_machines: None,
            state: Mutex::new(Allocations::default()),
        }
    }

    /// Limit the number of machines live at once.
    pub fn with_max_machines(mut self, max: usize) -> Self {
        self.max_machines = Some(max);
        self
    }

    pub fn machine_count(&self) -> usize {
        self.state.lock().machines.len()
    }
}

impl Default for LocalhostProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for LocalhostProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Machine, ProvisioningError> {
        let mut state = self.state.lock();
        if let Some(max) = self.max_machines
            && state.machines.len() >= max
        {
            return Err(ProvisioningError::Exhausted(format!(
                "localhost is limited to {max} machines"
            )));
        }

        // Nothing is reserved until every request has a port.
        let mut ports: BTreeMap<String, u16> = BTreeMap::new();
        for req in &request.ports {
            let port = req
                .range
                .iter()
                .find(|p| !state.ports.contains(p) && !ports.values().any(|taken| taken == p))
                .ok_or_else(|| {
                    ProvisioningError::Exhausted(format!(
                        "no free port in {} for {}",
                        req.range, req.name
                    ))
                })?;
            ports.insert(req.name.clone(), port);
        }
        state.ports.extend(ports.values().copied());

        let n = self.next_machine.fetch_add(1, Ordering::Relaxed) + 1;
        let machine = Machine {
            id: format!("localhost-{n}"),
            address: "127.0.0.1".to_string(),
            ports,
        };
        state
            .machines
            .insert(machine.id.clone(), machine.ports.values().copied().collect());
        debug!(
            entity = %request.entity,
            machine = %machine.id,
            ports = ?machine.ports,
            "provisioned localhost machine"
        );
        Ok(machine)
    }

    async fn release(&self, machine: &Machine) {
        let mut state = self.state.lock();
        if let Some(ports) = state.machines.remove(&machine.id) {
            for port in ports {
                state.ports.remove(&port);
            }
            debug!(machine = %machine.id, "released localhost machine");
        }
    }
}
