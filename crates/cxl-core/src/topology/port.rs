//! Ports and their downstream connections.

use std::fmt;

use super::{DecoderId, MemdevId, PortId};
use crate::hdm::Hdm;
use crate::lock::{LockClass, OrderedGuard, OrderedMutex};

/// Role of a port in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Platform root; its downstream ports are host bridges.
    Root,
    /// Host bridge (depth one) or switch; its downstream ports are root or switch ports.
    Switch,
    /// Endpoint port of a memory device.
    Endpoint,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Root => "root",
            Self::Switch => "port",
            Self::Endpoint => "endpoint",
        })
    }
}

/// Downstream connection point of a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dport {
    /// Hardware port id, unique within the owning port.
    pub port_id: u32,
    /// Name of the device behind the connection.
    pub device: String,
    /// Physical base of the connection's component registers.
    pub component_reg_phys: Option<u64>,
}

/// Mutable port bookkeeping, guarded by the port lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortState {
    /// Downstream ports, in registration order.
    pub dports: Vec<Dport>,
    /// Memory devices below this port that are still attached.
    pub endpoints: Vec<MemdevId>,
    /// Decoders owned by this port, in id order.
    pub decoders: Vec<DecoderId>,
    /// Set once the last interested endpoint detached.
    pub dead: bool,
}

impl PortState {
    /// Looks up a downstream port by hardware id.
    #[must_use]
    pub fn dport(&self, port_id: u32) -> Option<&Dport> {
        self.dports.iter().find(|dport| dport.port_id == port_id)
    }
}

/// Node of the port tree.
#[derive(Debug)]
pub struct Port {
    id: PortId,
    kind: PortKind,
    name: String,
    parent: Option<PortId>,
    parent_dport: Option<u32>,
    depth: u32,
    uport: String,
    component_reg_phys: Option<u64>,
    hdm: Option<Hdm>,
    state: OrderedMutex<PortState>,
}

/// Immutable attributes of a port being added to the tree.
#[derive(Debug)]
pub(crate) struct PortInit {
    pub(crate) kind: PortKind,
    pub(crate) parent: Option<PortId>,
    pub(crate) parent_dport: Option<u32>,
    pub(crate) depth: u32,
    pub(crate) uport: String,
    pub(crate) component_reg_phys: Option<u64>,
    pub(crate) hdm: Option<Hdm>,
}

impl Port {
    pub(crate) fn new(id: PortId, init: PortInit) -> Self {
        Self {
            id,
            kind: init.kind,
            name: format!("{}{id}", init.kind),
            parent: init.parent,
            parent_dport: init.parent_dport,
            depth: init.depth,
            uport: init.uport,
            component_reg_phys: init.component_reg_phys,
            hdm: init.hdm,
            state: OrderedMutex::new(LockClass::Port { depth: init.depth }, PortState::default()),
        }
    }

    /// Arena handle, also the port's numeric id.
    #[must_use]
    pub const fn id(&self) -> PortId {
        self.id
    }

    /// Role in the hierarchy.
    #[must_use]
    pub const fn kind(&self) -> PortKind {
        self.kind
    }

    /// `root<N>`, `port<N>`, or `endpoint<N>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent port; `None` only for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<PortId> {
        self.parent
    }

    /// Hardware id of the parent's downstream port this port hangs off.
    #[must_use]
    pub const fn parent_dport(&self) -> Option<u32> {
        self.parent_dport
    }

    /// Distance from the root; host bridges sit at depth one.
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Upstream device name.
    #[must_use]
    pub fn uport(&self) -> &str {
        &self.uport
    }

    /// Physical base of the component registers.
    #[must_use]
    pub const fn component_reg_phys(&self) -> Option<u64> {
        self.component_reg_phys
    }

    /// HDM decoder block, absent for ports decoded by software passthrough.
    #[must_use]
    pub const fn hdm(&self) -> Option<&Hdm> {
        self.hdm.as_ref()
    }

    /// Returns `true` for the platform root.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns `true` for a memory device endpoint port.
    #[must_use]
    pub const fn is_endpoint(&self) -> bool {
        matches!(self.kind, PortKind::Endpoint)
    }

    /// Locks the port bookkeeping.
    pub fn lock(&self) -> OrderedGuard<'_, PortState> {
        self.state.lock()
    }

    /// Returns `true` once no endpoint below the port remains attached.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }
}
