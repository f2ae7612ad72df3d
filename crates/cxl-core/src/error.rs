use std::time::Duration;

use thiserror::Error;

use crate::region::ConfigStage;
use crate::topology::DecoderKind;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CxlError>;

/// Error classes used for caller policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ErrorClass {
    /// Region or decoder parameters are invalid or incomplete.
    Configuration,
    /// The fabric shape cannot carry the requested interleave.
    Topology,
    /// Address space, decoders, device capacity, or ids ran out.
    Exhausted,
    /// Hardware refused or never acknowledged a request.
    Hardware,
    /// A participating device has no driver attached yet.
    NotReady,
    /// The object is active or being removed.
    Busy,
    /// The caller violated an API contract.
    Misuse,
}

impl ErrorClass {
    /// Returns `true` when retrying later may succeed without a configuration change.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Exhausted | Self::NotReady | Self::Busy)
    }
}

/// Register-window transport failures reported by [`crate::HdmIo`] implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MmioError {
    /// Offset does not fall inside the mapped register block.
    #[error("register offset {offset:#x} is outside the mapped block")]
    OutOfBounds {
        /// Byte offset from the block base.
        offset: u32,
    },
    /// Offset is not 32-bit aligned.
    #[error("register offset {offset:#x} is not 32-bit aligned")]
    Unaligned {
        /// Byte offset from the block base.
        offset: u32,
    },
    /// The device did not complete the access.
    #[error("register access at offset {offset:#x} failed")]
    AccessFailed {
        /// Byte offset from the block base.
        offset: u32,
    },
}

/// Specific reasons the cross-host-bridge routing check rejects a region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XhbViolation {
    /// Root decoder granularity is finer than the region granularity.
    #[error(
        "root granularity {root_granularity} is finer than region granularity {region_granularity}"
    )]
    RootGranularityTooFine {
        /// Root decoder granularity in bytes.
        root_granularity: u32,
        /// Region granularity in bytes.
        region_granularity: u32,
    },
    /// Root decoder fan-out needs more ways than the region provides.
    #[error("root decoder fan-out requires {required} ways, region has {ways}")]
    InsufficientWays {
        /// `(1 << granularity shift) * root ways`.
        required: u32,
        /// Region interleave ways.
        ways: u32,
    },
    /// Region ways are not a whole multiple of the root decoder fan-out.
    #[error("region ways {ways} are not a multiple of the root decoder fan-out {required}")]
    UnevenWays {
        /// `(1 << granularity shift) * root ways`.
        required: u32,
        /// Region interleave ways.
        ways: u32,
    },
    /// An endpoint position routes to the wrong root target slot.
    #[error(
        "position {position} reaches {host_bridge} at root slot {actual:?}, address routing expects slot {expected}"
    )]
    Misrouted {
        /// Region target position.
        position: usize,
        /// Name of the host bridge port above the endpoint.
        host_bridge: String,
        /// Root target slot derived from the position.
        expected: usize,
        /// Slot holding the host bridge in the root target list.
        actual: Option<usize>,
    },
}

/// Errors produced by topology construction, decoder programming, and region binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CxlError {
    /// Interleave ways outside the supported set.
    #[error("invalid interleave ways {ways}")]
    InvalidWays {
        /// Requested ways.
        ways: u32,
    },
    /// Interleave granularity outside the supported set.
    #[error("invalid interleave granularity {granularity}")]
    InvalidGranularity {
        /// Requested granularity in bytes.
        granularity: u32,
    },
    /// Region size is zero or not a multiple of the interleave alignment.
    #[error("region size {size:#x} is not a non-zero multiple of {align:#x}")]
    InvalidSize {
        /// Requested size in bytes.
        size: u64,
        /// Required alignment in bytes.
        align: u64,
    },
    /// A target position inside the configured ways has no memory device.
    #[error("region target {position} is not set")]
    MissingTarget {
        /// Empty target position.
        position: usize,
    },
    /// A target position lies beyond the configured ways.
    #[error("target position {position} is outside the configured {ways} ways")]
    TargetOutOfRange {
        /// Requested position.
        position: usize,
        /// Configured ways.
        ways: u32,
    },
    /// The same memory device appears at two target positions.
    #[error("memory device {memdev} is targeted at positions {first} and {second}")]
    DuplicateTarget {
        /// Memory device name.
        memdev: String,
        /// First position.
        first: usize,
        /// Second position.
        second: usize,
    },
    /// A region attribute was written out of configuration order.
    #[error("cannot set {field} at configuration stage {stage:?}")]
    OutOfOrder {
        /// Attribute being written.
        field: &'static str,
        /// Stage the region is currently in.
        stage: ConfigStage,
    },
    /// Region name does not parse as `region<port>.<decoder>:<id>`.
    #[error("invalid region name `{name}`")]
    InvalidRegionName {
        /// Supplied name.
        name: String,
    },
    /// Region name does not belong to the decoder it was submitted through.
    #[error("region name `{name}` does not belong to decoder {decoder}")]
    RegionNameMismatch {
        /// Supplied name.
        name: String,
        /// Decoder the request went through.
        decoder: String,
    },
    /// Region id was never handed out by the region-name query.
    #[error("region id {id} was not reserved on decoder {decoder}")]
    RegionIdNotReserved {
        /// Parsed id.
        id: u32,
        /// Root decoder name.
        decoder: String,
    },
    /// UUID text failed to parse.
    #[error("invalid uuid `{value}`")]
    InvalidUuid {
        /// Supplied text.
        value: String,
    },
    /// Target list exceeds the decoder's capacity.
    #[error("{count} targets exceed decoder capacity {capacity}")]
    TooManyTargets {
        /// Requested target count.
        count: usize,
        /// Capacity of the decoder target list.
        capacity: usize,
    },
    /// Target port id does not fit the 8-bit target list entry.
    #[error("target port id {id} does not fit a target list entry")]
    TargetIdOutOfRange {
        /// Port id.
        id: u32,
    },
    /// Decoder has no address range to program.
    #[error("decoder {decoder} has no address range configured")]
    UnconfiguredDecoder {
        /// Decoder name.
        decoder: String,
    },
    /// No root decoder on the platform can host the region.
    #[error("no root decoder can host region {region}")]
    NoRootDecoder {
        /// Region name.
        region: String,
    },
    /// Root decoder and endpoint disagree on QoS throttling group.
    #[error("root decoder {decoder} does not serve the QoS class of {memdev}")]
    QtgMismatch {
        /// Root decoder name.
        decoder: String,
        /// Memory device name.
        memdev: String,
    },
    /// Root decoder window cannot carry type-3 persistent memory.
    #[error("root decoder {decoder} lacks type-3 persistent memory capability")]
    NotPmemCapable {
        /// Root decoder name.
        decoder: String,
    },
    /// Region range does not fit the root decoder window.
    #[error("root decoder {decoder} window does not contain region {region}")]
    OutsideWindow {
        /// Root decoder name.
        decoder: String,
        /// Region name.
        region: String,
    },
    /// Cross-host-bridge routing check failed.
    #[error("cross host bridge check failed: {0}")]
    CrossHostBridge(#[from] XhbViolation),
    /// Endpoint sits below a switch.
    #[error("endpoint {endpoint} sits below a switch (port depth {depth})")]
    SwitchTopology {
        /// Endpoint port name.
        endpoint: String,
        /// Endpoint port depth.
        depth: u32,
    },
    /// Endpoints below one root port do not share an interleave residue.
    #[error(
        "root port {root_port} on {host_bridge} carries positions {first} and {second}, which differ under mask {mask:#x}"
    )]
    RootPortGrouping {
        /// Host bridge port name.
        host_bridge: String,
        /// Root port id.
        root_port: u32,
        /// First position seen below the root port.
        first: usize,
        /// Conflicting position.
        second: usize,
        /// Residue mask applied to positions.
        mask: usize,
    },
    /// Arena handle does not name a live object.
    #[error("unknown {kind} handle {index}")]
    UnknownHandle {
        /// Object kind.
        kind: &'static str,
        /// Arena index.
        index: usize,
    },
    /// Named object does not exist.
    #[error("no {kind} named `{name}`")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Requested name.
        name: String,
    },
    /// Port has no downstream port with the given id.
    #[error("{port} has no downstream port {dport}")]
    UnknownDport {
        /// Port name.
        port: String,
        /// Downstream port id.
        dport: u32,
    },
    /// Downstream port id registered twice on one port.
    #[error("{port} already has downstream port {dport}")]
    DuplicateDport {
        /// Port name.
        port: String,
        /// Downstream port id.
        dport: u32,
    },
    /// Port is not the kind the operation needs.
    #[error("{port} cannot be used as {expected}")]
    WrongPortKind {
        /// Port name.
        port: String,
        /// Expected role.
        expected: &'static str,
    },
    /// Decoder variant mismatch.
    #[error("decoder {decoder} is a {found} decoder, expected {expected}")]
    WrongDecoderKind {
        /// Decoder name.
        decoder: String,
        /// Expected variant.
        expected: DecoderKind,
        /// Actual variant.
        found: DecoderKind,
    },
    /// Port has no HDM register block.
    #[error("{port} has no HDM decoder registers")]
    NoHdmRegisters {
        /// Port name.
        port: String,
    },
    /// Decoder id registered twice on one port.
    #[error("{port} already has decoder {id}")]
    DuplicateDecoder {
        /// Port name.
        port: String,
        /// Decoder id.
        id: u32,
    },
    /// Root decoder window cannot supply the requested size.
    #[error("root decoder {decoder} cannot supply {size:#x} bytes of address space")]
    AddressSpaceExhausted {
        /// Root decoder name.
        decoder: String,
        /// Requested size.
        size: u64,
    },
    /// Memory device has no free device-physical capacity left.
    #[error("memory device {memdev} cannot supply {size:#x} bytes of capacity")]
    CapacityExhausted {
        /// Memory device name.
        memdev: String,
        /// Requested size.
        size: u64,
    },
    /// Root decoder has handed out every region id.
    #[error("root decoder {decoder} has no region ids left")]
    RegionIdsExhausted {
        /// Root decoder name.
        decoder: String,
    },
    /// Every decoder on the port is claimed or active.
    #[error("no free decoder on {port}")]
    NoFreeDecoder {
        /// Port name.
        port: String,
    },
    /// Root decoder is being torn down and accepts no new regions.
    #[error("root decoder {decoder} is being removed")]
    DecoderRemoved {
        /// Root decoder name.
        decoder: String,
    },
    /// Hardware did not report commit completion in time.
    #[error("decoder {decoder} commit timed out after {timeout:?} (ctrl {ctrl:#010x})")]
    CommitTimeout {
        /// Decoder name.
        decoder: String,
        /// Last control register value.
        ctrl: u32,
        /// Configured timeout.
        timeout: Duration,
    },
    /// Hardware flagged the commit as failed.
    #[error("decoder {decoder} reported a commit error (ctrl {ctrl:#010x})")]
    CommitError {
        /// Decoder name.
        decoder: String,
        /// Control register value.
        ctrl: u32,
    },
    /// Commit succeeded for some decoders before one failed.
    #[error("commit of {decoder} failed with {committed} decoder(s) left active: {source}")]
    PartialCommit {
        /// Decoder whose commit failed.
        decoder: String,
        /// Number of decoders still committed.
        committed: usize,
        /// Underlying commit failure.
        #[source]
        source: Box<CxlError>,
    },
    /// HDM capability register is unusable.
    #[error("{port} reports an invalid HDM capability {cap:#010x}")]
    InvalidHdmCapability {
        /// Port name.
        port: String,
        /// Raw capability register.
        cap: u32,
    },
    /// Decoder slot holds values no valid programming produces.
    #[error("decoder {decoder} slot is corrupt: {reason}")]
    CorruptDecoder {
        /// Decoder name.
        decoder: String,
        /// What was wrong with the slot.
        reason: &'static str,
    },
    /// No decoder slot on the port could be parsed.
    #[error("no valid decoders found on {port}")]
    NoValidDecoders {
        /// Port name.
        port: String,
    },
    /// Register transport failure.
    #[error(transparent)]
    Mmio(#[from] MmioError),
    /// Target memory device has no driver bound.
    #[error("memory device {memdev} is not ready")]
    DeviceNotReady {
        /// Memory device name.
        memdev: String,
    },
    /// Decoder slot is already committed with a live range.
    #[error("decoder {decoder} is already active in hardware")]
    DecoderActive {
        /// Decoder name.
        decoder: String,
    },
    /// Region is bound and its configuration is frozen.
    #[error("region {region} is active")]
    RegionActive {
        /// Region name.
        region: String,
    },
    /// Region keeps decoders from a failed commit that must be torn down first.
    #[error("region {region} still holds decoders from a failed commit")]
    RegionNeedsTeardown {
        /// Region name.
        region: String,
    },
    /// Region is being removed.
    #[error("region {region} is being removed")]
    RegionDead {
        /// Region name.
        region: String,
    },
    /// Commit or disable called with the wrong software enable state.
    #[error("decoder {decoder} enable state does not allow {operation}")]
    InvalidEnableState {
        /// Decoder name.
        decoder: String,
        /// Attempted operation.
        operation: &'static str,
    },
}

impl CxlError {
    /// Maps the error to its policy class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidWays { .. }
            | Self::InvalidGranularity { .. }
            | Self::InvalidSize { .. }
            | Self::MissingTarget { .. }
            | Self::TargetOutOfRange { .. }
            | Self::DuplicateTarget { .. }
            | Self::OutOfOrder { .. }
            | Self::InvalidRegionName { .. }
            | Self::RegionNameMismatch { .. }
            | Self::RegionIdNotReserved { .. }
            | Self::InvalidUuid { .. }
            | Self::TooManyTargets { .. }
            | Self::TargetIdOutOfRange { .. }
            | Self::NotFound { .. } => ErrorClass::Configuration,
            Self::NoRootDecoder { .. }
            | Self::QtgMismatch { .. }
            | Self::NotPmemCapable { .. }
            | Self::OutsideWindow { .. }
            | Self::CrossHostBridge(_)
            | Self::SwitchTopology { .. }
            | Self::RootPortGrouping { .. }
            | Self::UnknownDport { .. }
            | Self::DuplicateDport { .. }
            | Self::WrongPortKind { .. }
            | Self::NoHdmRegisters { .. }
            | Self::DuplicateDecoder { .. } => ErrorClass::Topology,
            Self::AddressSpaceExhausted { .. }
            | Self::CapacityExhausted { .. }
            | Self::RegionIdsExhausted { .. }
            | Self::NoFreeDecoder { .. } => ErrorClass::Exhausted,
            Self::CommitTimeout { .. }
            | Self::CommitError { .. }
            | Self::PartialCommit { .. }
            | Self::InvalidHdmCapability { .. }
            | Self::CorruptDecoder { .. }
            | Self::NoValidDecoders { .. }
            | Self::Mmio(_) => ErrorClass::Hardware,
            Self::DeviceNotReady { .. } => ErrorClass::NotReady,
            Self::DecoderActive { .. }
            | Self::RegionActive { .. }
            | Self::RegionNeedsTeardown { .. }
            | Self::RegionDead { .. }
            | Self::DecoderRemoved { .. } => ErrorClass::Busy,
            Self::UnknownHandle { .. }
            | Self::WrongDecoderKind { .. }
            | Self::UnconfiguredDecoder { .. }
            | Self::InvalidEnableState { .. } => ErrorClass::Misuse,
        }
    }

    /// Returns `true` when the failure is transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::{CxlError, ErrorClass, MmioError, XhbViolation};
    use crate::region::ConfigStage;

    #[test]
    fn retryable_classes_are_the_transient_ones() {
        let retryable = [ErrorClass::Exhausted, ErrorClass::NotReady, ErrorClass::Busy];
        let fatal = [
            ErrorClass::Configuration,
            ErrorClass::Topology,
            ErrorClass::Hardware,
            ErrorClass::Misuse,
        ];
        assert!(retryable.iter().all(|class| class.is_retryable()));
        assert!(fatal.iter().all(|class| !class.is_retryable()));
    }

    #[test]
    fn mmio_errors_convert_into_hardware_class() {
        let err: CxlError = MmioError::OutOfBounds { offset: 0x400 }.into();
        assert_eq!(err.class(), ErrorClass::Hardware);
        assert_eq!(err.to_string(), "register offset 0x400 is outside the mapped block");
    }

    #[test]
    fn partial_commit_exposes_its_source() {
        let inner = CxlError::CommitError {
            decoder: "decoder3.0".to_owned(),
            ctrl: 0x0000_0a00,
        };
        let err = CxlError::PartialCommit {
            decoder: "decoder3.0".to_owned(),
            committed: 2,
            source: Box::new(inner.clone()),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source, Some(inner.to_string()));
        assert_eq!(err.class(), ErrorClass::Hardware);
    }

    #[test]
    fn xhb_violations_wrap_as_topology_errors() {
        let err: CxlError = XhbViolation::InsufficientWays {
            required: 4,
            ways: 2,
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Topology);
        assert!(err.to_string().contains("requires 4 ways"));
    }

    #[test]
    fn setter_ordering_and_target_ids_are_configuration_errors() {
        let out_of_order = CxlError::OutOfOrder {
            field: "size",
            stage: ConfigStage::Granularity,
        };
        assert_eq!(out_of_order.class(), ErrorClass::Configuration);
        assert!(!out_of_order.is_retryable());

        let id = CxlError::TargetIdOutOfRange { id: 256 };
        assert_eq!(id.class(), ErrorClass::Configuration);
        assert!(id.to_string().contains("256"));
    }

    #[test]
    fn device_not_ready_is_retryable() {
        let err = CxlError::DeviceNotReady {
            memdev: "mem0".to_owned(),
        };
        assert!(err.is_retryable());
    }
}
