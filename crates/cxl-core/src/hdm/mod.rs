//! HDM decoder register access and capability parsing.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CxlError, MmioError, Result};

pub mod driver;
pub mod regs;
pub mod sim;

/// 32-bit access to one mapped HDM decoder capability block.
///
/// Offsets are byte offsets from the block base. Implementations serialize
/// their own accesses so one block may be shared across threads.
pub trait HdmIo: Send + Sync {
    /// Reads the register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MmioError`] when the access cannot be completed.
    fn read32(&self, offset: u32) -> std::result::Result<u32, MmioError>;

    /// Writes `value` to the register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`MmioError`] when the access cannot be completed.
    fn write32(&self, offset: u32, value: u32) -> std::result::Result<(), MmioError>;

    /// Reads a 64-bit value split across a low register and the register after it.
    ///
    /// The high half is read first.
    ///
    /// # Errors
    ///
    /// Returns [`MmioError`] when either access fails.
    fn read64_hi_lo(&self, low_offset: u32) -> std::result::Result<u64, MmioError> {
        let high = self.read32(low_offset + 4)?;
        let low = self.read32(low_offset)?;
        Ok((u64::from(high) << 32) | u64::from(low))
    }
}

/// Parsed HDM decoder capability register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HdmCaps {
    /// Decoder slots in the block.
    pub decoder_count: u32,
    /// Target-list entries per switch decoder.
    pub target_count: u32,
    /// Host address bits usable for interleave selection.
    pub interleave_mask: u64,
}

impl HdmCaps {
    /// Decodes a raw capability register value.
    ///
    /// Returns `None` for an all-ones read, which an unmapped block produces.
    #[must_use]
    pub const fn parse(cap: u32) -> Option<Self> {
        if cap == u32::MAX {
            return None;
        }
        let mut interleave_mask = 0_u64;
        if cap & regs::HDM_DECODER_INTERLEAVE_11_8 != 0 {
            interleave_mask |= 0x0000_0F00;
        }
        if cap & regs::HDM_DECODER_INTERLEAVE_14_12 != 0 {
            interleave_mask |= 0x0000_7000;
        }
        Some(Self {
            decoder_count: regs::decoder_count(cap),
            target_count: regs::target_count(cap),
            interleave_mask,
        })
    }
}

/// Mapped and enabled HDM decoder block of one port.
#[derive(Clone)]
pub struct Hdm {
    io: Arc<dyn HdmIo>,
    caps: HdmCaps,
}

impl Hdm {
    /// Parses capabilities and turns on global decode for the block.
    ///
    /// # Errors
    ///
    /// Returns [`CxlError::InvalidHdmCapability`] for an unusable capability
    /// register, or [`CxlError::Mmio`] when register access fails.
    pub fn setup(io: Arc<dyn HdmIo>, port: &str) -> Result<Self> {
        let cap = io.read32(regs::HDM_DECODER_CAP_OFFSET)?;
        let caps = HdmCaps::parse(cap).ok_or_else(|| CxlError::InvalidHdmCapability {
            port: port.to_owned(),
            cap,
        })?;
        let ctrl = io.read32(regs::HDM_DECODER_CTRL_OFFSET)?;
        io.write32(regs::HDM_DECODER_CTRL_OFFSET, ctrl | regs::HDM_DECODER_ENABLE)?;
        debug!(
            port,
            decoders = caps.decoder_count,
            targets = caps.target_count,
            "HDM decoders enabled"
        );
        Ok(Self { io, caps })
    }

    /// Register accessor.
    #[must_use]
    pub fn io(&self) -> &dyn HdmIo {
        self.io.as_ref()
    }

    /// Parsed capabilities.
    #[must_use]
    pub const fn caps(&self) -> HdmCaps {
        self.caps
    }
}

impl fmt::Debug for Hdm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hdm").field("caps", &self.caps).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{regs, Hdm, HdmCaps, HdmIo};
    use crate::error::CxlError;
    use crate::hdm::sim::SimHdm;

    #[test]
    fn caps_parse_counts_and_interleave_bits() {
        let caps = HdmCaps::parse(0x0000_0142).expect("valid cap");
        assert_eq!(caps.decoder_count, 4);
        assert_eq!(caps.target_count, 4);
        assert_eq!(caps.interleave_mask & 0x0F00, 0x0F00);
        assert_eq!(HdmCaps::parse(u32::MAX), None);
    }

    #[test]
    fn setup_sets_global_enable() {
        let sim = Arc::new(SimHdm::new(2, 4));
        let hdm = Hdm::setup(sim.clone(), "port1").expect("setup");
        assert_eq!(hdm.caps().decoder_count, 2);
        let ctrl = sim.read32(regs::HDM_DECODER_CTRL_OFFSET).expect("ctrl");
        assert_ne!(ctrl & regs::HDM_DECODER_ENABLE, 0);
    }

    #[test]
    fn setup_rejects_unmapped_block() {
        let sim = Arc::new(SimHdm::new(2, 4));
        sim.poke(regs::HDM_DECODER_CAP_OFFSET, u32::MAX);
        let err = Hdm::setup(sim, "port1").expect_err("all-ones cap");
        assert!(matches!(err, CxlError::InvalidHdmCapability { .. }));
    }

    #[test]
    fn split_reads_combine_high_then_low() {
        let sim = SimHdm::new(1, 1);
        sim.poke(regs::base_low_offset(0), 0xF000_0000);
        sim.poke(regs::base_high_offset(0), 0x0000_0010);
        assert_eq!(sim.read64_hi_lo(regs::base_low_offset(0)), Ok(0x10_F000_0000));
    }
}
