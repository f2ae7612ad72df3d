//! Regions: interleaved HPA ranges built from endpoint memory.

use std::fmt;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::interleave::MAX_INTERLEAVE;
use crate::lock::{LockClass, OrderedGuard, OrderedMutex};
use crate::resource::HpaRange;
use crate::topology::{DecoderId, MemdevId, RegionHandle};

mod bind;
mod config;
mod name;

pub use bind::{bind_region, unbind_region};
pub use config::sanitize_region;
pub use name::{
    create_region, create_region_name, delete_region, find_region, format_region_name,
    parse_region_name, remove_region, remove_root_decoder, RegionName,
};

/// Configuration progress of an inactive region.
///
/// Attributes must be written in stage order: granularity, ways, targets, size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ConfigStage {
    /// Nothing configured yet.
    #[default]
    Empty,
    /// Granularity set.
    Granularity,
    /// Ways set; targets may be assigned.
    Ways,
    /// Size set; the region can be bound.
    Size,
}

impl fmt::Display for ConfigStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty",
            Self::Granularity => "granularity",
            Self::Ways => "ways",
            Self::Size => "size",
        })
    }
}

/// Mutable region state, guarded by the region lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionState {
    /// Configuration progress.
    pub stage: ConfigStage,
    /// Region UUID; nil until set or generated at bind.
    pub uuid: Uuid,
    /// Size in bytes.
    pub size: u64,
    /// Interleave ways.
    pub interleave_ways: u32,
    /// Interleave granularity in bytes.
    pub interleave_granularity: u32,
    /// Memory device per interleave position.
    pub targets: [Option<MemdevId>; MAX_INTERLEAVE],
    /// Host physical range reserved at bind.
    pub res: Option<HpaRange>,
    /// Decoders are committed and the region decodes memory.
    pub active: bool,
    /// Region is being removed.
    pub dead: bool,
    /// Decoders claimed for the bind in progress.
    pub staged: Vec<DecoderId>,
    /// Decoders committed to hardware, in commit order.
    pub committed: Vec<DecoderId>,
}

impl Default for RegionState {
    fn default() -> Self {
        Self {
            stage: ConfigStage::Empty,
            uuid: Uuid::nil(),
            size: 0,
            interleave_ways: 0,
            interleave_granularity: 0,
            targets: [None; MAX_INTERLEAVE],
            res: None,
            active: false,
            dead: false,
            staged: Vec::new(),
            committed: Vec::new(),
        }
    }
}

impl RegionState {
    /// Copies the user-visible configuration.
    #[must_use]
    pub fn config(&self) -> RegionConfig {
        RegionConfig {
            stage: self.stage,
            uuid: self.uuid,
            size: self.size,
            interleave_ways: self.interleave_ways,
            interleave_granularity: self.interleave_granularity,
            targets: self.targets[..self.interleave_ways as usize].to_vec(),
            res: self.res,
            active: self.active,
        }
    }
}

/// Snapshot of a region's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    /// Configuration progress.
    pub stage: ConfigStage,
    /// Region UUID.
    pub uuid: Uuid,
    /// Size in bytes.
    pub size: u64,
    /// Interleave ways.
    pub interleave_ways: u32,
    /// Interleave granularity in bytes.
    pub interleave_granularity: u32,
    /// Memory device per interleave position, `interleave_ways` entries.
    pub targets: Vec<Option<MemdevId>>,
    /// Host physical range, present once bound.
    pub res: Option<HpaRange>,
    /// Region is bound.
    pub active: bool,
}

impl RegionConfig {
    /// Offset of the region inside the root decoder window.
    #[must_use]
    pub fn offset_in(&self, window: HpaRange) -> Option<u64> {
        self.res.map(|res| res.start - window.start)
    }
}

/// Region object owned by a root decoder.
#[derive(Debug)]
pub struct Region {
    handle: RegionHandle,
    id: u32,
    root: DecoderId,
    name: String,
    remove_lock: Mutex<()>,
    state: OrderedMutex<RegionState>,
}

impl Region {
    pub(crate) fn new(handle: RegionHandle, id: u32, root: DecoderId, name: String) -> Self {
        Self {
            handle,
            id,
            root,
            name,
            remove_lock: Mutex::new(()),
            state: OrderedMutex::new(LockClass::Region, RegionState::default()),
        }
    }

    /// Arena handle.
    #[must_use]
    pub const fn handle(&self) -> RegionHandle {
        self.handle
    }

    /// Region id within its root decoder.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Root decoder the region was created under. Fixed for the region's lifetime.
    #[must_use]
    pub const fn root(&self) -> DecoderId {
        self.root
    }

    /// `region<port>.<decoder>:<id>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks the region state.
    pub fn lock(&self) -> OrderedGuard<'_, RegionState> {
        self.state.lock()
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> RegionConfig {
        self.lock().config()
    }

    pub(crate) fn removal(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.remove_lock.lock()
    }
}
