//! In-memory HDM decoder block for tests and dry runs.
//!
//! Models the commit handshake of each slot: writing the commit bit makes the
//! slot report committed, report an error, never respond, or respond after a
//! number of status polls, depending on the configured [`CommitBehavior`].

use parking_lot::Mutex;

use super::regs;
use super::HdmIo;
use crate::error::MmioError;

/// How a simulated slot answers a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommitBehavior {
    /// Committed is visible on the next read.
    #[default]
    Immediate,
    /// Committed appears after this many reads of the control register.
    AfterPolls(u32),
    /// Committed never appears.
    Never,
    /// The commit-error bit is raised instead of committed.
    Error,
}

#[derive(Debug)]
struct SimState {
    regs: Vec<u32>,
    behaviors: Vec<CommitBehavior>,
    pending: Vec<Option<u32>>,
    writes: Vec<(u32, u32)>,
    failing: Option<u32>,
}

/// Register-accurate HDM decoder capability block held in memory.
#[derive(Debug)]
pub struct SimHdm {
    slots: u32,
    state: Mutex<SimState>,
}

impl SimHdm {
    /// Creates a block with `slots` decoders and `targets` target-list entries.
    ///
    /// `slots` is rounded up to an encodable count (one, or an even number up to 30).
    #[must_use]
    pub fn new(slots: u32, targets: u32) -> Self {
        let slots = slots.clamp(1, 30);
        let slots = if slots == 1 { 1 } else { slots.next_multiple_of(2) };
        let count = regs::count_field(slots).unwrap_or(0);
        let words = (regs::target_list_high_offset(slots - 1) / 4 + 1) as usize;
        let mut regs_file = vec![0_u32; words];
        regs_file[0] = regs::field_prep(regs::HDM_DECODER_COUNT_MASK, count)
            | regs::field_prep(regs::HDM_DECODER_TARGET_COUNT_MASK, targets)
            | regs::HDM_DECODER_INTERLEAVE_11_8;
        Self {
            slots,
            state: Mutex::new(SimState {
                regs: regs_file,
                behaviors: vec![CommitBehavior::Immediate; slots as usize],
                pending: vec![None; slots as usize],
                writes: Vec::new(),
                failing: None,
            }),
        }
    }

    /// Decoder slots in the block.
    #[must_use]
    pub const fn slots(&self) -> u32 {
        self.slots
    }

    /// Sets the commit response of `slot`.
    pub fn set_commit_behavior(&self, slot: u32, behavior: CommitBehavior) {
        if let Some(entry) = self.state.lock().behaviors.get_mut(slot as usize) {
            *entry = behavior;
        }
    }

    /// Stores a raw register value without side effects or logging.
    pub fn poke(&self, offset: u32, value: u32) {
        if let Some(reg) = self.state.lock().regs.get_mut((offset / 4) as usize) {
            *reg = value;
        }
    }

    /// Reads a raw register value without side effects.
    #[must_use]
    pub fn peek(&self, offset: u32) -> u32 {
        self.state
            .lock()
            .regs
            .get((offset / 4) as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Makes every access to `offset` fail until cleared with `None`.
    pub fn fail_at(&self, offset: Option<u32>) {
        self.state.lock().failing = offset;
    }

    /// Loads a slot as firmware would leave it: programmed and committed.
    pub fn preprogram(&self, slot: u32, base: u64, size: u64, ctrl: u32, targets: &[u8]) {
        let (tl_low, tl_high) = regs::pack_target_list(targets);
        #[allow(clippy::cast_possible_truncation)]
        let values = [
            (regs::base_low_offset(slot), base as u32),
            (regs::base_high_offset(slot), (base >> 32) as u32),
            (regs::size_low_offset(slot), size as u32),
            (regs::size_high_offset(slot), (size >> 32) as u32),
            (regs::target_list_low_offset(slot), tl_low),
            (regs::target_list_high_offset(slot), tl_high),
            (regs::ctrl_offset(slot), ctrl | regs::CTRL_COMMIT | regs::CTRL_COMMITTED),
        ];
        for (offset, value) in values {
            self.poke(offset, value);
        }
    }

    /// Every register write performed through [`HdmIo`], in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().writes.clone()
    }

    /// Forgets the recorded write history.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    fn slot_of_ctrl(&self, offset: u32) -> Option<u32> {
        if offset < regs::ctrl_offset(0) {
            return None;
        }
        let rel = offset - regs::ctrl_offset(0);
        rel.is_multiple_of(regs::HDM_DECODER_STRIDE)
            .then_some(rel / regs::HDM_DECODER_STRIDE)
            .filter(|&slot| slot < self.slots)
    }
}

impl SimState {
    fn check(&self, offset: u32) -> Result<usize, MmioError> {
        if self.failing == Some(offset) {
            return Err(MmioError::AccessFailed { offset });
        }
        if !offset.is_multiple_of(4) {
            return Err(MmioError::Unaligned { offset });
        }
        let index = (offset / 4) as usize;
        if index >= self.regs.len() {
            return Err(MmioError::OutOfBounds { offset });
        }
        Ok(index)
    }
}

const HW_STATUS_BITS: u32 = regs::CTRL_COMMITTED | regs::CTRL_COMMIT_ERROR;

impl HdmIo for SimHdm {
    fn read32(&self, offset: u32) -> Result<u32, MmioError> {
        let slot = self.slot_of_ctrl(offset);
        let mut state = self.state.lock();
        let index = state.check(offset)?;
        if let Some(slot) = slot.map(|slot| slot as usize) {
            match state.pending[slot] {
                Some(0) => {
                    state.pending[slot] = None;
                    state.regs[index] |= regs::CTRL_COMMITTED;
                }
                Some(left) => state.pending[slot] = Some(left - 1),
                None => {}
            }
        }
        Ok(state.regs[index])
    }

    fn write32(&self, offset: u32, value: u32) -> Result<(), MmioError> {
        let slot = self.slot_of_ctrl(offset);
        let mut state = self.state.lock();
        let index = state.check(offset)?;
        state.writes.push((offset, value));
        let Some(slot) = slot.map(|slot| slot as usize) else {
            state.regs[index] = value;
            return Ok(());
        };
        let mut ctrl = value & !HW_STATUS_BITS;
        state.pending[slot] = None;
        if value & regs::CTRL_COMMIT != 0 {
            match state.behaviors[slot] {
                CommitBehavior::Immediate => ctrl |= regs::CTRL_COMMITTED,
                CommitBehavior::AfterPolls(polls) => state.pending[slot] = Some(polls),
                CommitBehavior::Never => {}
                CommitBehavior::Error => ctrl |= regs::CTRL_COMMIT_ERROR,
            }
        }
        state.regs[index] = ctrl;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitBehavior, SimHdm};
    use crate::error::MmioError;
    use crate::hdm::{regs, HdmIo};

    #[test]
    fn capability_register_reflects_construction() {
        let sim = SimHdm::new(4, 8);
        let cap = sim.peek(regs::HDM_DECODER_CAP_OFFSET);
        assert_eq!(regs::decoder_count(cap), 4);
        assert_eq!(regs::target_count(cap), 8);
        assert_eq!(SimHdm::new(3, 1).slots(), 4);
    }

    #[test]
    fn commit_bit_sets_committed_immediately_by_default() {
        let sim = SimHdm::new(2, 1);
        sim.write32(regs::ctrl_offset(1), regs::CTRL_COMMIT).expect("write");
        let ctrl = sim.read32(regs::ctrl_offset(1)).expect("read");
        assert_eq!(ctrl & regs::CTRL_COMMITTED, regs::CTRL_COMMITTED);
    }

    #[test]
    fn delayed_commit_appears_after_polls() {
        let sim = SimHdm::new(1, 1);
        sim.set_commit_behavior(0, CommitBehavior::AfterPolls(2));
        sim.write32(regs::ctrl_offset(0), regs::CTRL_COMMIT).expect("write");
        let polls: Vec<bool> = (0..3)
            .map(|_| sim.read32(regs::ctrl_offset(0)).expect("read") & regs::CTRL_COMMITTED != 0)
            .collect();
        assert_eq!(polls, vec![false, false, true]);
    }

    #[test]
    fn software_cannot_write_status_bits() {
        let sim = SimHdm::new(1, 1);
        sim.write32(regs::ctrl_offset(0), regs::CTRL_COMMITTED | regs::CTRL_COMMIT_ERROR)
            .expect("write");
        assert_eq!(sim.peek(regs::ctrl_offset(0)), 0);
    }

    #[test]
    fn error_behavior_raises_commit_error() {
        let sim = SimHdm::new(1, 1);
        sim.set_commit_behavior(0, CommitBehavior::Error);
        sim.write32(regs::ctrl_offset(0), regs::CTRL_COMMIT).expect("write");
        let ctrl = sim.peek(regs::ctrl_offset(0));
        assert_eq!(ctrl & regs::CTRL_COMMITTED, 0);
        assert_ne!(ctrl & regs::CTRL_COMMIT_ERROR, 0);
    }

    #[test]
    fn out_of_range_and_injected_failures_are_reported() {
        let sim = SimHdm::new(1, 1);
        assert_eq!(
            sim.read32(0x1000),
            Err(MmioError::OutOfBounds { offset: 0x1000 })
        );
        assert_eq!(sim.read32(0x2), Err(MmioError::Unaligned { offset: 0x2 }));
        sim.fail_at(Some(regs::ctrl_offset(0)));
        assert_eq!(
            sim.write32(regs::ctrl_offset(0), 0),
            Err(MmioError::AccessFailed {
                offset: regs::ctrl_offset(0)
            })
        );
        assert!(sim.writes().is_empty());
    }
}
