//! Fabric object model: ports, decoders, memory devices, and regions.
//!
//! Objects live in arenas owned by [`Topology`] and refer to each other
//! through copyable handles. Parent links point up the tree and child lists
//! are kept in the owning port's locked state.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::CxlConfig;
use crate::error::{CxlError, Result};
use crate::hdm::{Hdm, HdmIo};
use crate::interleave::{is_valid_granularity, is_valid_ways};
use crate::region::Region;
use crate::resource::HpaRange;

pub mod decoder;
pub mod memdev;
pub mod port;

pub use decoder::{
    Decoder, DecoderFlags, DecoderKind, DecoderState, DecoderVariant, EndpointDecoder,
    RootDecoder, RootResources, SwitchDecoder, TargetList, TargetType,
};
pub use memdev::Memdev;
pub use port::{Dport, Port, PortKind, PortState};

use port::PortInit;

/// Handle of a port; doubles as the port's numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u32);

impl PortId {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric port id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecoderId(usize);

impl DecoderId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Handle of a memory device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemdevId(usize);

impl MemdevId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Handle of a region.
///
/// Region slots are reused after removal; the generation tells a stale
/// handle apart from the slot's current occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionHandle {
    index: usize,
    generation: u32,
}

impl RegionHandle {
    pub(crate) const fn new(index: usize) -> Self {
        Self::at(index, 0)
    }

    const fn at(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

#[derive(Debug, Default)]
struct RegionSlot {
    generation: u32,
    region: Option<Arc<Region>>,
}

/// Component register block handed to a new port.
#[derive(Clone)]
pub struct ComponentRegs {
    /// Physical base address of the block.
    pub phys: u64,
    /// Accessor for the HDM decoder capability inside the block.
    pub io: Arc<dyn HdmIo>,
}

impl fmt::Debug for ComponentRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegs")
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish_non_exhaustive()
    }
}

/// Platform window description for [`Topology::add_root_decoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDecoderDesc {
    /// Host physical window.
    pub window: HpaRange,
    /// Interleave ways across host bridges.
    pub interleave_ways: u32,
    /// Interleave granularity in bytes.
    pub interleave_granularity: u32,
    /// Memory types the window may carry.
    pub flags: DecoderFlags,
    /// QoS throttling group of the window.
    pub qtg_id: u16,
    /// Root downstream port ids, one per way, in interleave order.
    pub targets: Vec<u32>,
}

/// Arena of every fabric object plus the shared timing configuration.
#[derive(Debug, Default)]
pub struct Topology {
    config: CxlConfig,
    ports: RwLock<Vec<Arc<Port>>>,
    decoders: RwLock<Vec<Arc<Decoder>>>,
    memdevs: RwLock<Vec<Arc<Memdev>>>,
    regions: RwLock<Vec<RegionSlot>>,
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new(config: CxlConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Timing configuration.
    #[must_use]
    pub const fn config(&self) -> &CxlConfig {
        &self.config
    }

    /// Adds the platform root port.
    pub fn add_root_port(&self, uport: &str) -> PortId {
        let mut ports = self.ports.write();
        let id = next_port_id(&ports);
        ports.push(Arc::new(Port::new(
            id,
            PortInit {
                kind: PortKind::Root,
                parent: None,
                parent_dport: None,
                depth: 0,
                uport: uport.to_owned(),
                component_reg_phys: None,
                hdm: None,
            },
        )));
        info!(port = %id, uport, "added root port");
        id
    }

    /// Registers a downstream port on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::DuplicateDport`] when `port_id` is already present,
    /// or [`CxlError::WrongPortKind`] when `port` is an endpoint.
    pub fn add_dport(
        &self,
        port: PortId,
        port_id: u32,
        device: &str,
        component_reg_phys: Option<u64>,
    ) -> Result<()> {
        let port = self.port(port)?;
        if port.is_endpoint() {
            return Err(CxlError::WrongPortKind {
                port: port.name().to_owned(),
                expected: "a port with downstream ports",
            });
        }
        let mut state = port.lock();
        if state.dport(port_id).is_some() {
            return Err(CxlError::DuplicateDport {
                port: port.name().to_owned(),
                dport: port_id,
            });
        }
        state.dports.push(Dport {
            port_id,
            device: device.to_owned(),
            component_reg_phys,
        });
        debug!(port = port.name(), dport = port_id, device, "added dport");
        Ok(())
    }

    /// Adds a host bridge or switch port below `parent`.
    ///
    /// # Errors
    ///
    /// Fails when `parent` is unknown or an endpoint, when `parent_dport` is
    /// not registered on it, or when the HDM block cannot be set up.
    pub fn add_port(
        &self,
        parent: PortId,
        parent_dport: u32,
        uport: &str,
        regs: Option<ComponentRegs>,
    ) -> Result<PortId> {
        self.attach_port(PortKind::Switch, parent, parent_dport, uport, regs)
    }

    /// Adds the endpoint port of a memory device below `parent`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::add_port`].
    pub fn add_endpoint_port(
        &self,
        parent: PortId,
        parent_dport: u32,
        uport: &str,
        regs: Option<ComponentRegs>,
    ) -> Result<PortId> {
        self.attach_port(PortKind::Endpoint, parent, parent_dport, uport, regs)
    }

    fn attach_port(
        &self,
        kind: PortKind,
        parent: PortId,
        parent_dport: u32,
        uport: &str,
        regs: Option<ComponentRegs>,
    ) -> Result<PortId> {
        let parent_port = self.port(parent)?;
        if parent_port.is_endpoint() {
            return Err(CxlError::WrongPortKind {
                port: parent_port.name().to_owned(),
                expected: "a parent port",
            });
        }
        if parent_port.lock().dport(parent_dport).is_none() {
            return Err(CxlError::UnknownDport {
                port: parent_port.name().to_owned(),
                dport: parent_dport,
            });
        }
        let mut ports = self.ports.write();
        let id = next_port_id(&ports);
        let name = format!("{kind}{id}");
        let (component_reg_phys, hdm) = match regs {
            Some(regs) => (Some(regs.phys), Some(Hdm::setup(regs.io, &name)?)),
            None => (None, None),
        };
        let depth = parent_port.depth() + 1;
        ports.push(Arc::new(Port::new(
            id,
            PortInit {
                kind,
                parent: Some(parent),
                parent_dport: Some(parent_dport),
                depth,
                uport: uport.to_owned(),
                component_reg_phys,
                hdm,
            },
        )));
        info!(port = %name, parent = parent_port.name(), depth, uport, "added port");
        Ok(id)
    }

    /// Adds a memory device on an endpoint port and records its interest in every ancestor.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::WrongPortKind`] when `endpoint` is not an endpoint port.
    pub fn add_memdev(
        &self,
        name: &str,
        endpoint: PortId,
        capacity: u64,
        qtg_id: u16,
    ) -> Result<MemdevId> {
        let port = self.port(endpoint)?;
        if !port.is_endpoint() {
            return Err(CxlError::WrongPortKind {
                port: port.name().to_owned(),
                expected: "an endpoint port",
            });
        }
        let handle = {
            let mut memdevs = self.memdevs.write();
            let handle = MemdevId::new(memdevs.len());
            memdevs.push(Arc::new(Memdev::new(handle, name, endpoint, capacity, qtg_id)));
            handle
        };
        for ancestor in self.ancestors(endpoint)? {
            let mut state = ancestor.lock();
            state.endpoints.push(handle);
            state.dead = false;
        }
        info!(memdev = name, endpoint = port.name(), capacity, "added memdev");
        Ok(handle)
    }

    /// Marks the driver of `memdev` bound or unbound.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for a stale handle.
    pub fn set_memdev_bound(&self, memdev: MemdevId, bound: bool) -> Result<()> {
        let memdev = self.memdev(memdev)?;
        memdev.set_bound(bound);
        debug!(memdev = memdev.name(), bound, "memdev driver state");
        Ok(())
    }

    /// Detaches `memdev` and drops its interest in every ancestor port.
    ///
    /// Non-root ports left without interested endpoints are marked dead.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for a stale handle.
    pub fn detach_memdev(&self, handle: MemdevId) -> Result<()> {
        let memdev = self.memdev(handle)?;
        memdev.set_bound(false);
        for ancestor in self.ancestors(memdev.endpoint())? {
            let mut state = ancestor.lock();
            state.endpoints.retain(|&endpoint| endpoint != handle);
            if state.endpoints.is_empty() && !ancestor.is_root() && !state.dead {
                state.dead = true;
                info!(port = ancestor.name(), "last endpoint detached, port is dead");
            }
        }
        Ok(())
    }

    /// Adds a platform window decoder to the root port.
    ///
    /// # Errors
    ///
    /// Fails when `root` is not the root port, when ways or granularity are
    /// invalid, or when the target list does not name one root downstream
    /// port per way.
    pub fn add_root_decoder(&self, root: PortId, desc: RootDecoderDesc) -> Result<DecoderId> {
        let port = self.port(root)?;
        if !port.is_root() {
            return Err(CxlError::WrongPortKind {
                port: port.name().to_owned(),
                expected: "the root port",
            });
        }
        if !is_valid_ways(desc.interleave_ways) {
            return Err(CxlError::InvalidWays {
                ways: desc.interleave_ways,
            });
        }
        if !is_valid_granularity(desc.interleave_granularity) {
            return Err(CxlError::InvalidGranularity {
                granularity: desc.interleave_granularity,
            });
        }
        if desc.targets.len() != desc.interleave_ways as usize {
            return Err(CxlError::TooManyTargets {
                count: desc.targets.len(),
                capacity: desc.interleave_ways as usize,
            });
        }
        {
            let state = port.lock();
            if let Some(&missing) = desc.targets.iter().find(|&&id| state.dport(id).is_none()) {
                return Err(CxlError::UnknownDport {
                    port: port.name().to_owned(),
                    dport: missing,
                });
            }
        }
        let id = u32::try_from(port.lock().decoders.len()).unwrap_or(u32::MAX);
        let state = DecoderState {
            interleave_ways: desc.interleave_ways,
            interleave_granularity: desc.interleave_granularity,
            target_type: TargetType::Expander,
            flags: desc.flags | DecoderFlags::ENABLE,
            range: Some(desc.window),
            region: None,
        };
        let variant = DecoderVariant::root(desc.window, desc.qtg_id, &desc.targets)?;
        let handle = self.insert_decoder(&port, id, state, variant)?;
        info!(
            port = port.name(),
            id,
            window = %desc.window,
            ways = desc.interleave_ways,
            granularity = desc.interleave_granularity,
            "added root decoder"
        );
        Ok(handle)
    }

    /// Adds the software decoder of a single-ported host bridge without HDM registers.
    ///
    /// # Errors
    ///
    /// Fails when the port has HDM registers, is not a host bridge or switch,
    /// or does not have exactly one downstream port.
    pub fn add_passthrough_decoder(&self, port: PortId) -> Result<DecoderId> {
        let port = self.port(port)?;
        if port.kind() != PortKind::Switch || port.hdm().is_some() {
            return Err(CxlError::WrongPortKind {
                port: port.name().to_owned(),
                expected: "a host bridge without decoder registers",
            });
        }
        let dport = {
            let state = port.lock();
            match state.dports.as_slice() {
                [only] => only.port_id,
                _ => {
                    return Err(CxlError::WrongPortKind {
                        port: port.name().to_owned(),
                        expected: "a single-ported host bridge",
                    })
                }
            }
        };
        let variant = DecoderVariant::switch(1, &[dport])?;
        let handle = self.insert_decoder(&port, 0, DecoderState::idle(), variant)?;
        debug!(port = port.name(), dport, "added passthrough decoder");
        Ok(handle)
    }

    pub(crate) fn insert_decoder(
        &self,
        port: &Port,
        id: u32,
        state: DecoderState,
        variant: DecoderVariant,
    ) -> Result<DecoderId> {
        let mut port_state = port.lock();
        let duplicate = {
            let decoders = self.decoders.read();
            port_state
                .decoders
                .iter()
                .any(|handle| decoders.get(handle.0).is_some_and(|decoder| decoder.id() == id))
        };
        if duplicate {
            return Err(CxlError::DuplicateDecoder {
                port: port.name().to_owned(),
                id,
            });
        }
        let mut decoders = self.decoders.write();
        let handle = DecoderId::new(decoders.len());
        decoders.push(Arc::new(Decoder::new(
            handle,
            port.id(),
            port.depth(),
            id,
            state,
            variant,
        )));
        port_state.decoders.push(handle);
        Ok(handle)
    }

    /// Looks up a port.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for an unknown id.
    pub fn port(&self, id: PortId) -> Result<Arc<Port>> {
        self.ports
            .read()
            .get(id.index())
            .cloned()
            .ok_or(CxlError::UnknownHandle {
                kind: "port",
                index: id.index(),
            })
    }

    /// Looks up a decoder.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for an unknown handle.
    pub fn decoder(&self, id: DecoderId) -> Result<Arc<Decoder>> {
        self.decoders
            .read()
            .get(id.0)
            .cloned()
            .ok_or(CxlError::UnknownHandle {
                kind: "decoder",
                index: id.0,
            })
    }

    /// Looks up a memory device.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for an unknown handle.
    pub fn memdev(&self, id: MemdevId) -> Result<Arc<Memdev>> {
        self.memdevs
            .read()
            .get(id.0)
            .cloned()
            .ok_or(CxlError::UnknownHandle {
                kind: "memdev",
                index: id.0,
            })
    }

    /// Looks up a live region.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] once the region has been removed.
    pub fn region(&self, handle: RegionHandle) -> Result<Arc<Region>> {
        self.regions
            .read()
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.region.clone())
            .ok_or(CxlError::UnknownHandle {
                kind: "region",
                index: handle.index,
            })
    }

    /// Finds a memory device by name.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::NotFound`] when no device has that name.
    pub fn find_memdev(&self, name: &str) -> Result<MemdevId> {
        self.memdevs
            .read()
            .iter()
            .find(|memdev| memdev.name() == name)
            .map(|memdev| memdev.handle())
            .ok_or_else(|| CxlError::NotFound {
                kind: "memdev",
                name: name.to_owned(),
            })
    }

    /// Finds a decoder by `decoder<port>.<id>` name.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::NotFound`] when no decoder has that name.
    pub fn find_decoder(&self, name: &str) -> Result<DecoderId> {
        self.decoders
            .read()
            .iter()
            .find(|decoder| decoder.name() == name)
            .map(|decoder| decoder.handle())
            .ok_or_else(|| CxlError::NotFound {
                kind: "decoder",
                name: name.to_owned(),
            })
    }

    /// Every port, root first.
    #[must_use]
    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().clone()
    }

    /// Every memory device in attach order.
    #[must_use]
    pub fn memdevs(&self) -> Vec<Arc<Memdev>> {
        self.memdevs.read().clone()
    }

    /// Every live region.
    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions
            .read()
            .iter()
            .filter_map(|slot| slot.region.clone())
            .collect()
    }

    /// Decoders owned by `port`, in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] for an unknown port.
    pub fn decoders_of(&self, port: PortId) -> Result<Vec<Arc<Decoder>>> {
        let handles = self.port(port)?.lock().decoders.clone();
        handles.into_iter().map(|handle| self.decoder(handle)).collect()
    }

    /// Root decoders of every root port.
    #[must_use]
    pub fn root_decoders(&self) -> Vec<Arc<Decoder>> {
        self.decoders
            .read()
            .iter()
            .filter(|decoder| decoder.kind() == DecoderKind::Root)
            .cloned()
            .collect()
    }

    /// Ports from `port` up to and including the root.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::UnknownHandle`] when a parent link is stale.
    pub fn ancestors(&self, port: PortId) -> Result<Vec<Arc<Port>>> {
        let mut chain = Vec::new();
        let mut next = Some(port);
        while let Some(id) = next {
            let port = self.port(id)?;
            next = port.parent();
            chain.push(port);
        }
        Ok(chain)
    }

    /// Host bridge above `port`, the ancestor at depth one.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::WrongPortKind`] for the root itself.
    pub fn host_bridge_of(&self, port: PortId) -> Result<Arc<Port>> {
        let chain = self.ancestors(port)?;
        chain
            .into_iter()
            .find(|ancestor| ancestor.depth() == 1)
            .ok_or_else(|| CxlError::WrongPortKind {
                port: format!("port{port}"),
                expected: "a port below a host bridge",
            })
    }

    pub(crate) fn insert_region(&self, build: impl FnOnce(RegionHandle) -> Region) -> Arc<Region> {
        let mut regions = self.regions.write();
        let index = regions
            .iter()
            .position(|slot| slot.region.is_none())
            .unwrap_or(regions.len());
        if index == regions.len() {
            regions.push(RegionSlot::default());
        }
        let slot = &mut regions[index];
        let region = Arc::new(build(RegionHandle::at(index, slot.generation)));
        slot.region = Some(Arc::clone(&region));
        region
    }

    pub(crate) fn forget_region(&self, handle: RegionHandle) {
        let mut regions = self.regions.write();
        if let Some(slot) = regions
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
        {
            slot.region = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }
}

fn next_port_id(ports: &[Arc<Port>]) -> PortId {
    PortId::new(u32::try_from(ports.len()).unwrap_or(u32::MAX))
}
