//! CXL fabric memory region binding: topology model, HDM decoder programming,
//! and region validation, bind, and teardown.

/// Error taxonomy and crate result alias.
pub mod error;
pub use error::{CxlError, ErrorClass, MmioError, Result, XhbViolation};

/// Timing configuration for commit polling and enumeration settle.
pub mod config;
pub use config::{
    CxlConfig, DEFAULT_COMMIT_POLL_INTERVAL, DEFAULT_COMMIT_TIMEOUT, DEFAULT_SETTLE_DELAY,
};

/// Interleave ways and granularity encodings.
pub mod interleave;
pub use interleave::{
    encoding_from_granularity, encoding_from_ways, granularity_from_encoding, is_valid_granularity,
    is_valid_ways, region_alignment, ways_from_encoding, MAX_GRANULARITY, MAX_INTERLEAVE,
    MIN_GRANULARITY, REGION_ALIGN,
};

/// Ranked topology locks with debug-build ordering checks.
pub mod lock;
pub use lock::{LockClass, OrderedGuard, OrderedMutex};

/// Address pools, busy-range trees, and id allocators.
pub mod resource;
pub use resource::{AddressPool, HpaRange, IdAllocator, ResourceTree};

/// HDM decoder registers, driver, and simulated register block.
pub mod hdm;
pub use hdm::driver::{commit_decoder, disable_decoder, enumerate_decoders};
pub use hdm::sim::{CommitBehavior, SimHdm};
pub use hdm::{Hdm, HdmCaps, HdmIo};

/// Fabric object model.
pub mod topology;
pub use topology::{
    ComponentRegs, Decoder, DecoderFlags, DecoderId, DecoderKind, DecoderState, DecoderVariant,
    Dport, Memdev, MemdevId, Port, PortId, PortKind, RegionHandle, RootDecoderDesc, TargetList,
    TargetType, Topology,
};

/// Root decoder selection and fabric routing checks.
pub mod validate;
pub use validate::{find_root_decoder, rootd_valid, RegionRequest, TargetPath};

/// Region configuration, naming, bind, and teardown.
pub mod region;
pub use region::{
    bind_region, create_region, create_region_name, delete_region, find_region, remove_region,
    remove_root_decoder, sanitize_region, unbind_region, ConfigStage, Region, RegionConfig,
    RegionName, RegionState,
};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
