//! Decoder objects at every level of the fabric.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use super::{DecoderId, PortId, RegionHandle};
use crate::error::{CxlError, Result};
use crate::interleave::{MAX_INTERLEAVE, REGION_ALIGN};
use crate::lock::{LockClass, OrderedGuard, OrderedMutex};
use crate::resource::{AddressPool, HpaRange, IdAllocator, ResourceTree};

bitflags! {
    /// Capability and state flags carried by a decoder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DecoderFlags: u32 {
        /// Window may map volatile memory.
        const RAM = 1 << 0;
        /// Window may map persistent memory.
        const PMEM = 1 << 1;
        /// Window may map type-2 (accelerator) devices.
        const TYPE2 = 1 << 2;
        /// Window may map type-3 (expander) devices.
        const TYPE3 = 1 << 3;
        /// Hardware configuration is locked.
        const LOCK = 1 << 4;
        /// Decoder is committed and decoding.
        const ENABLE = 1 << 5;
    }
}

impl DecoderFlags {
    /// Returns `true` when both persistent memory and type-3 targets are allowed.
    #[must_use]
    pub const fn is_pmem_type3(self) -> bool {
        self.contains(Self::PMEM.union(Self::TYPE3))
    }
}

/// Device class a decoder routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TargetType {
    /// Type-2 accelerator with its own coherent memory.
    Accelerator,
    /// Type-3 memory expander.
    #[default]
    Expander,
}

/// Decoder variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    /// Platform window at the fabric root.
    Root,
    /// Host bridge or switch decoder fanning out to downstream ports.
    Switch,
    /// Endpoint decoder translating into device memory.
    Endpoint,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Root => "root",
            Self::Switch => "switch",
            Self::Endpoint => "endpoint",
        })
    }
}

/// Mutable decoder configuration, guarded by the decoder lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderState {
    /// Interleave ways.
    pub interleave_ways: u32,
    /// Interleave granularity in bytes.
    pub interleave_granularity: u32,
    /// Target device class.
    pub target_type: TargetType,
    /// Capability and state flags.
    pub flags: DecoderFlags,
    /// Decoded host physical range, `None` when unprogrammed.
    pub range: Option<HpaRange>,
    /// Region currently claiming this decoder.
    pub region: Option<RegionHandle>,
}

impl DecoderState {
    /// Unprogrammed single-way state.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            interleave_ways: 1,
            interleave_granularity: crate::interleave::MIN_GRANULARITY,
            target_type: TargetType::Expander,
            flags: DecoderFlags::empty(),
            range: None,
            region: None,
        }
    }

    /// Returns `true` when a region may claim this decoder.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.region.is_none() && !self.flags.intersects(DecoderFlags::ENABLE.union(DecoderFlags::LOCK))
    }

    /// Drops a region claim and its programming.
    pub const fn release(&mut self) {
        self.region = None;
        self.range = None;
    }
}

const EMPTY_SLOT: u32 = u32::MAX;

/// Ordered downstream-port ids a decoder interleaves across.
///
/// Readers take consistent snapshots without blocking; writers serialize on
/// an internal mutex and bump a sequence counter around each update.
#[derive(Debug)]
pub struct TargetList {
    seq: AtomicU64,
    len: AtomicUsize,
    slots: [AtomicU32; MAX_INTERLEAVE],
    capacity: usize,
    writer: Mutex<()>,
}

impl TargetList {
    /// Creates an empty list holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| AtomicU32::new(EMPTY_SLOT)),
            capacity: capacity.min(MAX_INTERLEAVE),
            writer: Mutex::new(()),
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replaces the list contents.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::TooManyTargets`] when `ids` exceeds the capacity.
    pub fn store(&self, ids: &[u32]) -> Result<()> {
        if ids.len() > self.capacity {
            return Err(CxlError::TooManyTargets {
                count: ids.len(),
                capacity: self.capacity,
            });
        }
        let _writer = self.writer.lock();
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        for (index, slot) in self.slots.iter().enumerate() {
            slot.store(ids.get(index).copied().unwrap_or(EMPTY_SLOT), Ordering::Relaxed);
        }
        self.len.store(ids.len(), Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Returns a consistent copy of the list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u32> {
        loop {
            let start = self.seq.load(Ordering::Acquire);
            if start & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let len = self.len.load(Ordering::Relaxed).min(MAX_INTERLEAVE);
            let ids: Vec<u32> = self.slots[..len]
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed))
                .collect();
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == start {
                return ids;
            }
        }
    }

    /// Position of `port_id` in the list.
    #[must_use]
    pub fn position(&self, port_id: u32) -> Option<usize> {
        self.snapshot().iter().position(|&id| id == port_id)
    }
}

/// Allocation state of a root decoder window.
#[derive(Debug)]
pub struct RootResources {
    pool: AddressPool,
    busy: ResourceTree,
    ids: IdAllocator,
    pending: BTreeSet<u32>,
    regions: Vec<RegionHandle>,
    removing: bool,
}

impl RootResources {
    fn new(window: HpaRange) -> Self {
        Self {
            pool: AddressPool::new(window, REGION_ALIGN),
            busy: ResourceTree::new(window),
            ids: IdAllocator::new(),
            pending: BTreeSet::new(),
            regions: Vec::new(),
            removing: false,
        }
    }

    /// Carves `size` bytes out of the window and marks them busy under `owner`.
    pub fn reserve(&mut self, size: u64, owner: &str) -> Option<HpaRange> {
        let range = self.pool.alloc(size)?;
        if self.busy.request(range, owner) {
            Some(range)
        } else {
            self.pool.free(range);
            None
        }
    }

    /// Returns a reservation made by [`Self::reserve`].
    pub fn release(&mut self, range: HpaRange) {
        self.busy.release(range);
        self.pool.free(range);
    }

    /// Bytes still free in the window.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.pool.available()
    }

    /// Allocates the next region id and remembers it as reserved.
    pub fn reserve_region_id(&mut self) -> Option<u32> {
        let id = self.ids.alloc()?;
        self.pending.insert(id);
        Some(id)
    }

    /// Returns `true` while `id` is reserved but not yet claimed by a region.
    #[must_use]
    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains(&id)
    }

    /// Consumes a reserved id for a new region.
    pub fn claim_region_id(&mut self, id: u32, region: RegionHandle) -> bool {
        if !self.pending.remove(&id) {
            return false;
        }
        self.regions.push(region);
        true
    }

    /// Forgets `region` and returns its id to the allocator.
    pub fn retire_region(&mut self, id: u32, region: RegionHandle) {
        self.regions.retain(|&handle| handle != region);
        self.ids.free(id);
    }

    /// Returns `true` while `id` belongs to a reserved or live region.
    #[must_use]
    pub fn is_id_taken(&self, id: u32) -> bool {
        self.ids.is_taken(id)
    }

    /// Live regions under this window, in creation order.
    #[must_use]
    pub fn regions(&self) -> &[RegionHandle] {
        &self.regions
    }

    /// Returns `true` once teardown of the window has started.
    #[must_use]
    pub const fn is_removing(&self) -> bool {
        self.removing
    }

    /// Stops further region creation.
    pub const fn start_removal(&mut self) {
        self.removing = true;
    }
}

/// Platform address window at the fabric root.
#[derive(Debug)]
pub struct RootDecoder {
    window: HpaRange,
    qtg_id: u16,
    targets: TargetList,
    resources: Mutex<RootResources>,
}

impl RootDecoder {
    /// Window decoded by this root.
    #[must_use]
    pub const fn window(&self) -> HpaRange {
        self.window
    }

    /// QoS throttling group the window serves.
    #[must_use]
    pub const fn qtg_id(&self) -> u16 {
        self.qtg_id
    }

    /// Host bridge ports the window interleaves across.
    #[must_use]
    pub const fn targets(&self) -> &TargetList {
        &self.targets
    }

    /// Locks the allocation state. Leaf lock: take no other lock while holding it.
    pub fn resources(&self) -> parking_lot::MutexGuard<'_, RootResources> {
        self.resources.lock()
    }
}

/// Host bridge or switch decoder.
#[derive(Debug)]
pub struct SwitchDecoder {
    targets: TargetList,
}

impl SwitchDecoder {
    /// Downstream ports the decoder interleaves across.
    #[must_use]
    pub const fn targets(&self) -> &TargetList {
        &self.targets
    }
}

/// Endpoint decoder owning a slice of device memory.
#[derive(Debug, Default)]
pub struct EndpointDecoder {
    dpa: Mutex<Option<HpaRange>>,
}

impl EndpointDecoder {
    /// Device-physical range assigned to the decoder.
    #[must_use]
    pub fn dpa(&self) -> Option<HpaRange> {
        *self.dpa.lock()
    }

    /// Replaces the device-physical assignment, returning the previous one.
    pub fn set_dpa(&self, dpa: Option<HpaRange>) -> Option<HpaRange> {
        std::mem::replace(&mut *self.dpa.lock(), dpa)
    }
}

/// Variant payload of a decoder.
#[derive(Debug)]
pub enum DecoderVariant {
    /// Root window.
    Root(RootDecoder),
    /// Host bridge or switch.
    Switch(SwitchDecoder),
    /// Endpoint.
    Endpoint(EndpointDecoder),
}

impl DecoderVariant {
    /// Builds a root variant over `window` serving `qtg_id` and routing to `targets`.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::TooManyTargets`] when `targets` exceeds the interleave limit.
    pub fn root(window: HpaRange, qtg_id: u16, targets: &[u32]) -> Result<Self> {
        let list = TargetList::new(MAX_INTERLEAVE);
        list.store(targets)?;
        Ok(Self::Root(RootDecoder {
            window,
            qtg_id,
            targets: list,
            resources: Mutex::new(RootResources::new(window)),
        }))
    }

    /// Builds a switch variant with room for `capacity` targets.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::TooManyTargets`] when `targets` exceeds `capacity`.
    pub fn switch(capacity: usize, targets: &[u32]) -> Result<Self> {
        let list = TargetList::new(capacity);
        list.store(targets)?;
        Ok(Self::Switch(SwitchDecoder { targets: list }))
    }

    /// Builds an endpoint variant.
    #[must_use]
    pub fn endpoint() -> Self {
        Self::Endpoint(EndpointDecoder::default())
    }

    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> DecoderKind {
        match self {
            Self::Root(_) => DecoderKind::Root,
            Self::Switch(_) => DecoderKind::Switch,
            Self::Endpoint(_) => DecoderKind::Endpoint,
        }
    }
}

/// One decoder instance attached to a port.
#[derive(Debug)]
pub struct Decoder {
    handle: DecoderId,
    port: PortId,
    port_depth: u32,
    id: u32,
    name: String,
    state: OrderedMutex<DecoderState>,
    variant: DecoderVariant,
}

impl Decoder {
    pub(crate) fn new(
        handle: DecoderId,
        port: PortId,
        port_depth: u32,
        id: u32,
        state: DecoderState,
        variant: DecoderVariant,
    ) -> Self {
        Self {
            handle,
            port,
            port_depth,
            id,
            name: format!("decoder{port}.{id}"),
            state: OrderedMutex::new(LockClass::Decoder { port_depth }, state),
            variant,
        }
    }

    /// Arena handle.
    #[must_use]
    pub const fn handle(&self) -> DecoderId {
        self.handle
    }

    /// Owning port.
    #[must_use]
    pub const fn port(&self) -> PortId {
        self.port
    }

    /// Depth of the owning port.
    #[must_use]
    pub const fn port_depth(&self) -> u32 {
        self.port_depth
    }

    /// Decoder id within its port; equals the hardware slot for HDM decoders.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// `decoder<port>.<id>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variant payload.
    #[must_use]
    pub const fn variant(&self) -> &DecoderVariant {
        &self.variant
    }

    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> DecoderKind {
        self.variant.kind()
    }

    /// Locks the decoder configuration.
    pub fn lock(&self) -> OrderedGuard<'_, DecoderState> {
        self.state.lock()
    }

    /// Target list of a root or switch decoder.
    #[must_use]
    pub const fn targets(&self) -> Option<&TargetList> {
        match &self.variant {
            DecoderVariant::Root(root) => Some(&root.targets),
            DecoderVariant::Switch(switch) => Some(&switch.targets),
            DecoderVariant::Endpoint(_) => None,
        }
    }

    /// Root payload.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::WrongDecoderKind`] for other variants.
    pub fn as_root(&self) -> Result<&RootDecoder> {
        match &self.variant {
            DecoderVariant::Root(root) => Ok(root),
            _ => Err(self.wrong_kind(DecoderKind::Root)),
        }
    }

    /// Switch payload.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::WrongDecoderKind`] for other variants.
    pub fn as_switch(&self) -> Result<&SwitchDecoder> {
        match &self.variant {
            DecoderVariant::Switch(switch) => Ok(switch),
            _ => Err(self.wrong_kind(DecoderKind::Switch)),
        }
    }

    /// Endpoint payload.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::WrongDecoderKind`] for other variants.
    pub fn as_endpoint(&self) -> Result<&EndpointDecoder> {
        match &self.variant {
            DecoderVariant::Endpoint(endpoint) => Ok(endpoint),
            _ => Err(self.wrong_kind(DecoderKind::Endpoint)),
        }
    }

    fn wrong_kind(&self, expected: DecoderKind) -> CxlError {
        CxlError::WrongDecoderKind {
            decoder: self.name.clone(),
            expected,
            found: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        Decoder, DecoderFlags, DecoderKind, DecoderState, DecoderVariant, RootResources,
        TargetList,
    };
    use crate::error::CxlError;
    use crate::interleave::REGION_ALIGN;
    use crate::resource::HpaRange;
    use crate::topology::{DecoderId, PortId, RegionHandle};

    #[test]
    fn target_list_store_and_snapshot() {
        let list = TargetList::new(4);
        list.store(&[7, 3]).expect("fits");
        assert_eq!(list.snapshot(), vec![7, 3]);
        assert_eq!(list.position(3), Some(1));
        assert_eq!(list.position(9), None);
        assert_eq!(
            list.store(&[1, 2, 3, 4, 5]),
            Err(CxlError::TooManyTargets {
                count: 5,
                capacity: 4
            })
        );
        assert_eq!(list.snapshot(), vec![7, 3]);
    }

    #[test]
    fn target_list_snapshots_stay_consistent_under_writes() {
        let list = Arc::new(TargetList::new(8));
        list.store(&[1, 1, 1, 1]).expect("fits");
        std::thread::scope(|scope| {
            let writer = Arc::clone(&list);
            scope.spawn(move || {
                for round in 0..2_000_u32 {
                    let value = round % 2 + 1;
                    writer.store(&[value; 4]).expect("fits");
                }
            });
            for _ in 0..2_000 {
                let snapshot = list.snapshot();
                assert_eq!(snapshot.len(), 4);
                assert!(snapshot.iter().all(|&id| id == snapshot[0]), "torn read {snapshot:?}");
            }
        });
    }

    #[test]
    fn variant_accessors_reject_wrong_kind() {
        let decoder = Decoder::new(
            DecoderId::new(0),
            PortId::new(2),
            2,
            0,
            DecoderState::idle(),
            DecoderVariant::endpoint(),
        );
        assert_eq!(decoder.name(), "decoder2.0");
        assert!(decoder.as_endpoint().is_ok());
        assert!(decoder.targets().is_none());
        match decoder.as_root() {
            Err(CxlError::WrongDecoderKind {
                expected, found, ..
            }) => {
                assert_eq!(expected, DecoderKind::Root);
                assert_eq!(found, DecoderKind::Endpoint);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn free_state_requires_no_claim_enable_or_lock() {
        let mut state = DecoderState::idle();
        assert!(state.is_free());
        state.flags.insert(DecoderFlags::LOCK);
        assert!(!state.is_free());
        state.flags = DecoderFlags::empty();
        state.region = Some(RegionHandle::new(0));
        assert!(!state.is_free());
        state.release();
        assert!(state.is_free());
    }

    #[test]
    fn root_resources_pair_pool_and_busy_tree() {
        let window = HpaRange::new(0x40_0000_0000, 2 * REGION_ALIGN);
        let mut resources = RootResources::new(window);
        let first = resources.reserve(REGION_ALIGN, "region0.0:0").expect("space");
        assert!(resources.reserve(2 * REGION_ALIGN, "region0.0:1").is_none());
        assert_eq!(resources.available(), REGION_ALIGN);
        resources.release(first);
        assert_eq!(resources.available(), 2 * REGION_ALIGN);
        assert!(resources.reserve(2 * REGION_ALIGN, "region0.0:1").is_some());
    }

    #[test]
    fn region_ids_must_be_reserved_before_claim() {
        let mut resources = RootResources::new(HpaRange::new(0, REGION_ALIGN));
        let handle = RegionHandle::new(0);
        assert!(!resources.claim_region_id(0, handle));
        let id = resources.reserve_region_id().expect("id");
        assert!(resources.claim_region_id(id, handle));
        assert_eq!(resources.regions(), &[handle]);
        resources.retire_region(id, handle);
        assert!(!resources.is_id_taken(id));
        assert!(resources.regions().is_empty());
    }

    #[test]
    fn pmem_type3_needs_both_flags() {
        assert!((DecoderFlags::PMEM | DecoderFlags::TYPE3).is_pmem_type3());
        assert!(!DecoderFlags::PMEM.is_pmem_type3());
    }
}
