//! Start gates — preconditions an entity awaits before running its behaviour.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Open,
    Failed(String),
}

/// Producer side of a gate.
#[derive(Debug, Clone)]
pub struct GateHandle {
    tx: watch::Sender<GateState>,
}

impl GateHandle {
    pub fn open(&self) {
        self.tx.send_replace(GateState::Open);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.tx.send_replace(GateState::Failed(reason.into()));
    }

    pub fn state(&self) -> GateState {
        self.tx.borrow().clone()
    }
}

/// Consumer side of a gate, held by the entity.
#[derive(Debug, Clone)]
pub struct StartGate {
    pub name: String,
    pub(crate) rx: watch::Receiver<GateState>,
}

impl StartGate {
    pub fn state(&self) -> GateState {
        self.rx.borrow().clone()
    }
}

/// Create a pending gate.
pub fn start_gate(name: impl Into<String>) -> (GateHandle, StartGate) {
    let (tx, rx) = watch::channel(GateState::Pending);
    (
        GateHandle { tx },
        StartGate {
            name: name.into(),
            rx,
        },
    )
}
