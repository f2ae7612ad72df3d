//! Ordered region attribute setters and pre-bind sanitization.

use tracing::debug;
use uuid::Uuid;

use super::{ConfigStage, Region, RegionState};
use crate::error::{CxlError, Result};
use crate::interleave::{is_valid_granularity, is_valid_ways, region_alignment, MAX_INTERLEAVE};
use crate::topology::{MemdevId, Topology};

impl Region {
    /// Sets the interleave granularity. Allowed before ways are set.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::OutOfOrder`] after ways were set,
    /// [`CxlError::InvalidGranularity`] for an unsupported value, or a busy
    /// error when the region is bound or being removed.
    pub fn set_granularity(&self, granularity: u32) -> Result<()> {
        let mut state = self.lock();
        self.check_mutable(&state)?;
        expect_stage(&state, "granularity", &[ConfigStage::Empty, ConfigStage::Granularity])?;
        if !is_valid_granularity(granularity) {
            return Err(CxlError::InvalidGranularity { granularity });
        }
        state.interleave_granularity = granularity;
        state.stage = ConfigStage::Granularity;
        debug!(region = self.name(), granularity, "granularity set");
        Ok(())
    }

    /// Sets the interleave ways, dropping targets beyond the new count.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::OutOfOrder`] before granularity or after size was
    /// set, [`CxlError::InvalidWays`] for an unsupported value, or a busy
    /// error when the region is bound or being removed.
    pub fn set_ways(&self, ways: u32) -> Result<()> {
        let mut state = self.lock();
        self.check_mutable(&state)?;
        expect_stage(&state, "interleave_ways", &[ConfigStage::Granularity, ConfigStage::Ways])?;
        if !is_valid_ways(ways) {
            return Err(CxlError::InvalidWays { ways });
        }
        for slot in &mut state.targets[ways as usize..] {
            *slot = None;
        }
        state.interleave_ways = ways;
        state.stage = ConfigStage::Ways;
        debug!(region = self.name(), ways, "ways set");
        Ok(())
    }

    /// Assigns or clears the memory device at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::OutOfOrder`] unless ways are set and size is not,
    /// [`CxlError::TargetOutOfRange`] for a position beyond the ways, or a
    /// busy error when the region is bound or being removed.
    pub fn set_target(&self, position: usize, memdev: Option<MemdevId>) -> Result<()> {
        let mut state = self.lock();
        self.check_mutable(&state)?;
        expect_stage(&state, "target", &[ConfigStage::Ways])?;
        if position >= state.interleave_ways as usize {
            return Err(CxlError::TargetOutOfRange {
                position,
                ways: state.interleave_ways,
            });
        }
        state.targets[position] = memdev;
        debug!(region = self.name(), position, ?memdev, "target set");
        Ok(())
    }

    /// Sets the region size once every target is assigned.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::OutOfOrder`] before ways are set,
    /// [`CxlError::MissingTarget`] for an unassigned position,
    /// [`CxlError::InvalidSize`] for a size that is zero or not a multiple
    /// of the interleave alignment, or a busy error when the region is bound
    /// or being removed.
    pub fn set_size(&self, size: u64) -> Result<()> {
        let mut state = self.lock();
        self.check_mutable(&state)?;
        expect_stage(&state, "size", &[ConfigStage::Ways, ConfigStage::Size])?;
        if let Some(position) = first_missing(&state) {
            return Err(CxlError::MissingTarget { position });
        }
        let align = region_alignment(state.interleave_ways);
        if size == 0 || !size.is_multiple_of(align) {
            return Err(CxlError::InvalidSize { size, align });
        }
        state.size = size;
        state.stage = ConfigStage::Size;
        debug!(region = self.name(), size, "size set");
        Ok(())
    }

    /// Sets the region UUID.
    ///
    /// # Errors
    ///
    /// Returns a busy error when the region is bound or being removed.
    pub fn set_uuid(&self, uuid: Uuid) -> Result<()> {
        let mut state = self.lock();
        self.check_mutable(&state)?;
        state.uuid = uuid;
        debug!(region = self.name(), %uuid, "uuid set");
        Ok(())
    }

    /// Parses and sets the region UUID.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::InvalidUuid`] when `value` does not parse, plus the
    /// errors of [`Self::set_uuid`].
    pub fn set_uuid_str(&self, value: &str) -> Result<()> {
        let uuid = Uuid::parse_str(value).map_err(|_| CxlError::InvalidUuid {
            value: value.to_owned(),
        })?;
        self.set_uuid(uuid)
    }

    fn check_mutable(&self, state: &RegionState) -> Result<()> {
        let region = self.name().to_owned();
        if state.dead {
            Err(CxlError::RegionDead { region })
        } else if state.active {
            Err(CxlError::RegionActive { region })
        } else if !state.committed.is_empty() {
            Err(CxlError::RegionNeedsTeardown { region })
        } else {
            Ok(())
        }
    }
}

fn expect_stage(state: &RegionState, field: &'static str, allowed: &[ConfigStage]) -> Result<()> {
    if allowed.contains(&state.stage) {
        Ok(())
    } else {
        Err(CxlError::OutOfOrder {
            field,
            stage: state.stage,
        })
    }
}

fn first_missing(state: &RegionState) -> Option<usize> {
    state.targets[..state.interleave_ways as usize]
        .iter()
        .position(Option::is_none)
}

/// Checks that a region is completely and consistently configured for bind.
///
/// Returns the target list in position order.
///
/// # Errors
///
/// Configuration errors for bad geometry, missing or duplicate targets,
/// and [`CxlError::DeviceNotReady`] for a target without a bound driver.
pub fn sanitize_region(topology: &Topology, state: &RegionState) -> Result<Vec<MemdevId>> {
    if state.stage != ConfigStage::Size {
        return Err(CxlError::OutOfOrder {
            field: "bind",
            stage: state.stage,
        });
    }
    let ways = state.interleave_ways;
    if !is_valid_ways(ways) {
        return Err(CxlError::InvalidWays { ways });
    }
    if !is_valid_granularity(state.interleave_granularity) {
        return Err(CxlError::InvalidGranularity {
            granularity: state.interleave_granularity,
        });
    }
    let align = region_alignment(ways);
    if state.size == 0 || !state.size.is_multiple_of(align) {
        return Err(CxlError::InvalidSize {
            size: state.size,
            align,
        });
    }

    let mut targets: Vec<MemdevId> = Vec::with_capacity(MAX_INTERLEAVE);
    for (position, slot) in state.targets[..ways as usize].iter().enumerate() {
        let memdev = slot.ok_or(CxlError::MissingTarget { position })?;
        if let Some(first) = targets.iter().position(|&seen| seen == memdev) {
            return Err(CxlError::DuplicateTarget {
                memdev: topology.memdev(memdev)?.name().to_owned(),
                first,
                second: position,
            });
        }
        targets.push(memdev);
    }
    for &memdev in &targets {
        let memdev = topology.memdev(memdev)?;
        if !memdev.is_bound() {
            return Err(CxlError::DeviceNotReady {
                memdev: memdev.name().to_owned(),
            });
        }
    }
    Ok(targets)
}
