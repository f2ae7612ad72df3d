//! Memory devices at the leaves of the fabric.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{MemdevId, PortId};
use crate::interleave::REGION_ALIGN;
use crate::resource::{AddressPool, HpaRange};

/// Memory device attached below an endpoint port.
#[derive(Debug)]
pub struct Memdev {
    handle: MemdevId,
    name: String,
    endpoint: PortId,
    qtg_id: u16,
    capacity: u64,
    bound: AtomicBool,
    dpa: Mutex<AddressPool>,
}

impl Memdev {
    pub(crate) fn new(
        handle: MemdevId,
        name: &str,
        endpoint: PortId,
        capacity: u64,
        qtg_id: u16,
    ) -> Self {
        Self {
            handle,
            name: name.to_owned(),
            endpoint,
            qtg_id,
            capacity,
            bound: AtomicBool::new(false),
            dpa: Mutex::new(AddressPool::new(HpaRange::new(0, capacity), REGION_ALIGN)),
        }
    }

    /// Arena handle.
    #[must_use]
    pub const fn handle(&self) -> MemdevId {
        self.handle
    }

    /// Device name, for example `mem0`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint port of the device.
    #[must_use]
    pub const fn endpoint(&self) -> PortId {
        self.endpoint
    }

    /// QoS throttling group the device reports.
    #[must_use]
    pub const fn qtg_id(&self) -> u16 {
        self.qtg_id
    }

    /// Device-physical capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns `true` while a driver is bound to the device.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn set_bound(&self, bound: bool) {
        self.bound.store(bound, Ordering::Release);
    }

    /// Claims `size` bytes of device-physical capacity.
    pub fn alloc_dpa(&self, size: u64) -> Option<HpaRange> {
        self.dpa.lock().alloc(size)
    }

    /// Returns capacity claimed by [`Self::alloc_dpa`].
    pub fn free_dpa(&self, range: HpaRange) {
        self.dpa.lock().free(range);
    }

    /// Unclaimed device-physical capacity.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        self.dpa.lock().available()
    }
}

#[cfg(test)]
mod tests {
    use super::Memdev;
    use crate::interleave::REGION_ALIGN;
    use crate::topology::{MemdevId, PortId};

    #[test]
    fn dpa_allocation_is_bounded_by_capacity() {
        let memdev = Memdev::new(MemdevId::new(0), "mem0", PortId::new(3), 2 * REGION_ALIGN, 0);
        let first = memdev.alloc_dpa(REGION_ALIGN).expect("capacity");
        assert_eq!(first.start, 0);
        assert!(memdev.alloc_dpa(2 * REGION_ALIGN).is_none());
        memdev.free_dpa(first);
        assert_eq!(memdev.free_capacity(), 2 * REGION_ALIGN);
    }

    #[test]
    fn bound_flag_starts_clear() {
        let memdev = Memdev::new(MemdevId::new(1), "mem1", PortId::new(4), REGION_ALIGN, 0);
        assert!(!memdev.is_bound());
        memdev.set_bound(true);
        assert!(memdev.is_bound());
        assert_eq!(memdev.name(), "mem1");
    }
}
