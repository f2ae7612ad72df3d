//! JSON fabric description and the builder that turns it into a live [`Topology`].
//!
//! Every port that declares an `hdm` block is backed by a [`SimHdm`]. Host
//! bridges without one get a passthrough decoder. Regions listed in the file
//! are created and bound in order once the fabric is up.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cxl_core::hdm::regs::COMPONENT_REG_BLOCK_SIZE;
use cxl_core::{
    bind_region, create_region, create_region_name, enumerate_decoders, remove_region,
    CommitBehavior, ComponentRegs, CxlConfig, DecoderFlags, DecoderId, HpaRange, MemdevId, PortId,
    Region, RootDecoderDesc, SimHdm, Topology,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::units::{parse_size, SizeError};

const COMPONENT_REG_BASE: u64 = 0xfe00_0000;

/// Byte count written either as a JSON number or as a size string such as `"256M"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSize")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Number(u64),
    Text(String),
}

impl TryFrom<RawSize> for ByteSize {
    type Error = SizeError;

    fn try_from(raw: RawSize) -> Result<Self, Self::Error> {
        match raw {
            RawSize::Number(bytes) => Ok(Self(bytes)),
            RawSize::Text(text) => parse_size(&text).map(Self),
        }
    }
}

/// Top-level topology description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    /// Timing overrides; defaults apply to anything left out.
    #[serde(default)]
    pub timing: Timing,
    /// Name of the platform root device.
    #[serde(default = "default_root")]
    pub root: String,
    /// Host bridges below the root, each on its own root downstream port.
    pub host_bridges: Vec<HostBridgeEntry>,
    /// Platform windows on the root.
    pub root_decoders: Vec<RootDecoderEntry>,
    /// Regions to create and bind once the fabric is built.
    #[serde(default)]
    pub regions: Vec<RegionEntry>,
}

fn default_root() -> String {
    "ACPI0017:00".to_owned()
}

/// Optional overrides of [`CxlConfig`].
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timing {
    /// Commit acknowledgement timeout in milliseconds.
    pub commit_timeout_ms: Option<u64>,
    /// Enumeration settle delay in milliseconds.
    pub settle_delay_ms: Option<u64>,
    /// Commit poll interval in microseconds.
    pub commit_poll_interval_us: Option<u64>,
}

impl Timing {
    /// Applies the overrides on top of the hardware defaults.
    #[must_use]
    pub fn config(self) -> CxlConfig {
        let defaults = CxlConfig::default();
        CxlConfig {
            commit_timeout: self
                .commit_timeout_ms
                .map_or(defaults.commit_timeout, Duration::from_millis),
            settle_delay: self
                .settle_delay_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
            commit_poll_interval: self
                .commit_poll_interval_us
                .map_or(defaults.commit_poll_interval, Duration::from_micros),
        }
    }
}

/// How a simulated block answers commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Commits land on the next status read.
    #[default]
    Immediate,
    /// Commits land after a few status reads.
    Delayed,
    /// Commits never land.
    Never,
    /// Commits raise the error bit.
    Error,
}

impl CommitMode {
    const fn behavior(self) -> CommitBehavior {
        match self {
            Self::Immediate => CommitBehavior::Immediate,
            Self::Delayed => CommitBehavior::AfterPolls(4),
            Self::Never => CommitBehavior::Never,
            Self::Error => CommitBehavior::Error,
        }
    }
}

/// Simulated HDM decoder block.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HdmEntry {
    /// Decoder slots.
    #[serde(default = "default_bridge_decoders")]
    pub decoders: u32,
    /// Target-list entries per decoder.
    #[serde(default = "default_targets")]
    pub targets: u32,
    /// Commit response of every slot.
    #[serde(default)]
    pub commit: CommitMode,
}

const fn default_bridge_decoders() -> u32 {
    2
}

const fn default_targets() -> u32 {
    8
}

/// Host bridge below the root.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostBridgeEntry {
    /// Device name of the bridge.
    pub name: String,
    /// Root downstream port id the bridge sits on.
    pub dport: u32,
    /// Decoder registers; a bridge without them must have one root port.
    #[serde(default)]
    pub hdm: Option<HdmEntry>,
    /// Root ports of the bridge.
    pub root_ports: Vec<RootPortEntry>,
}

/// Root port of a host bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootPortEntry {
    /// Downstream port id on the bridge.
    pub id: u32,
    /// PCI device name; derived from the bridge name when absent.
    #[serde(default)]
    pub device: Option<String>,
    /// Memory devices attached directly below this root port.
    #[serde(default)]
    pub memdevs: Vec<MemdevEntry>,
}

/// Memory device with its endpoint port.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemdevEntry {
    /// Device name, e.g. `mem0`.
    pub name: String,
    /// Device capacity.
    pub capacity: ByteSize,
    /// Whether the device driver is bound.
    #[serde(default = "default_bound")]
    pub bound: bool,
    /// QoS throttling group.
    #[serde(default)]
    pub qtg_id: u16,
    /// Endpoint decoder slots.
    #[serde(default = "default_endpoint_decoders")]
    pub decoders: u32,
    /// Commit response of the endpoint's slots.
    #[serde(default)]
    pub commit: CommitMode,
}

const fn default_bound() -> bool {
    true
}

const fn default_endpoint_decoders() -> u32 {
    1
}

/// Capability of a platform window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFlag {
    /// Volatile memory.
    Ram,
    /// Persistent memory.
    Pmem,
    /// Accelerator devices.
    Type2,
    /// Memory expanders.
    Type3,
}

impl WindowFlag {
    const fn flag(self) -> DecoderFlags {
        match self {
            Self::Ram => DecoderFlags::RAM,
            Self::Pmem => DecoderFlags::PMEM,
            Self::Type2 => DecoderFlags::TYPE2,
            Self::Type3 => DecoderFlags::TYPE3,
        }
    }
}

/// Platform window decoder.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootDecoderEntry {
    /// Window base address.
    pub base: ByteSize,
    /// Window size.
    pub size: ByteSize,
    /// Interleave granularity in bytes.
    pub granularity: u32,
    /// Root downstream port ids in interleave order; ways is their count.
    pub targets: Vec<u32>,
    /// Window capabilities.
    #[serde(default = "default_window_flags")]
    pub flags: Vec<WindowFlag>,
    /// QoS throttling group served.
    #[serde(default)]
    pub qtg_id: u16,
}

fn default_window_flags() -> Vec<WindowFlag> {
    vec![WindowFlag::Pmem, WindowFlag::Type3]
}

/// Region to create and bind.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionEntry {
    /// Root decoder name; may be omitted when the platform has exactly one.
    #[serde(default)]
    pub root: Option<String>,
    /// Interleave granularity in bytes.
    pub granularity: u32,
    /// Memory device names in position order; ways is their count.
    pub targets: Vec<String>,
    /// Region size.
    pub size: ByteSize,
    /// Region UUID; generated at bind when absent.
    #[serde(default)]
    pub uuid: Option<String>,
}

/// Built fabric plus the regions bound while loading it.
#[derive(Debug)]
pub struct Fabric {
    /// The live topology.
    pub topology: Topology,
    /// Platform root port.
    pub root: PortId,
    /// Regions from the file, in file order.
    pub regions: Vec<Arc<Region>>,
}

/// Reads and builds a topology file.
///
/// # Errors
///
/// Fails when the file cannot be read or parsed, when the description is
/// inconsistent, or when a declared region fails to bind.
pub fn load(path: &Path) -> Result<Fabric> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: TopologyFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    build(&file).with_context(|| format!("building topology from {}", path.display()))
}

/// Builds the fabric described by `file` and binds its regions.
///
/// # Errors
///
/// Fails on the first topology construction or region bind error.
pub fn build(file: &TopologyFile) -> Result<Fabric> {
    let topology = Topology::new(file.timing.config());
    let root = topology.add_root_port(&file.root);
    let mut phys = COMPONENT_REG_BASE;
    let mut next_regs = |hdm: HdmEntry| {
        let sim = Arc::new(SimHdm::new(hdm.decoders, hdm.targets));
        for slot in 0..sim.slots() {
            sim.set_commit_behavior(slot, hdm.commit.behavior());
        }
        let regs = ComponentRegs { phys, io: sim };
        phys += u64::from(COMPONENT_REG_BLOCK_SIZE);
        regs
    };

    for bridge in &file.host_bridges {
        topology
            .add_dport(root, bridge.dport, &bridge.name, None)
            .with_context(|| format!("adding root dport {} for {}", bridge.dport, bridge.name))?;
        let port = topology
            .add_port(root, bridge.dport, &bridge.name, bridge.hdm.map(&mut next_regs))
            .with_context(|| format!("adding host bridge {}", bridge.name))?;
        for rp in &bridge.root_ports {
            let device = rp
                .device
                .clone()
                .unwrap_or_else(|| format!("{}:{:02x}.0", bridge.name, rp.id));
            topology
                .add_dport(port, rp.id, &device, None)
                .with_context(|| format!("adding root port {} on {}", rp.id, bridge.name))?;
        }
        if bridge.hdm.is_some() {
            enumerate_decoders(&topology, port)
                .with_context(|| format!("enumerating decoders of {}", bridge.name))?;
        } else {
            topology
                .add_passthrough_decoder(port)
                .with_context(|| format!("{} has no decoder registers", bridge.name))?;
        }

        for rp in &bridge.root_ports {
            for memdev in &rp.memdevs {
                add_memdev(&topology, port, rp.id, memdev, &mut next_regs)?;
            }
        }
    }

    for entry in &file.root_decoders {
        let ways = u32::try_from(entry.targets.len()).context("too many root targets")?;
        let flags = entry
            .flags
            .iter()
            .fold(DecoderFlags::empty(), |acc, flag| acc | flag.flag());
        let handle = topology
            .add_root_decoder(
                root,
                RootDecoderDesc {
                    window: HpaRange::new(entry.base.0, entry.size.0),
                    interleave_ways: ways,
                    interleave_granularity: entry.granularity,
                    flags,
                    qtg_id: entry.qtg_id,
                    targets: entry.targets.clone(),
                },
            )
            .with_context(|| format!("adding root decoder at {:#x}", entry.base.0))?;
        debug!(?handle, ways, "root decoder ready");
    }

    let mut regions = Vec::with_capacity(file.regions.len());
    for entry in &file.regions {
        let plan = RegionPlan {
            root: entry.root.clone(),
            granularity: entry.granularity,
            targets: entry.targets.clone(),
            size: entry.size.0,
            uuid: entry.uuid.clone(),
        };
        regions.push(create_and_bind(&topology, &plan)?);
    }
    info!(
        ports = topology.ports().len(),
        memdevs = topology.memdevs().len(),
        regions = regions.len(),
        "topology loaded"
    );
    Ok(Fabric {
        topology,
        root,
        regions,
    })
}

fn add_memdev(
    topology: &Topology,
    bridge: PortId,
    root_port: u32,
    entry: &MemdevEntry,
    next_regs: &mut impl FnMut(HdmEntry) -> ComponentRegs,
) -> Result<MemdevId> {
    let regs = next_regs(HdmEntry {
        decoders: entry.decoders,
        targets: 0,
        commit: entry.commit,
    });
    let endpoint = topology
        .add_endpoint_port(bridge, root_port, &entry.name, Some(regs))
        .with_context(|| format!("adding endpoint port for {}", entry.name))?;
    enumerate_decoders(topology, endpoint)
        .with_context(|| format!("enumerating decoders of {}", entry.name))?;
    let memdev = topology
        .add_memdev(&entry.name, endpoint, entry.capacity.0, entry.qtg_id)
        .with_context(|| format!("adding memdev {}", entry.name))?;
    topology.set_memdev_bound(memdev, entry.bound)?;
    Ok(memdev)
}

/// Region request in user terms: names instead of handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPlan {
    /// Root decoder name, or `None` to use the only one.
    pub root: Option<String>,
    /// Interleave granularity in bytes.
    pub granularity: u32,
    /// Memory device names in position order.
    pub targets: Vec<String>,
    /// Region size in bytes.
    pub size: u64,
    /// UUID text.
    pub uuid: Option<String>,
}

/// Resolves the root decoder a plan names.
///
/// # Errors
///
/// Fails when the name is unknown, or when no name is given and the
/// platform does not have exactly one root decoder.
pub fn resolve_root(topology: &Topology, root: Option<&str>) -> Result<DecoderId> {
    if let Some(name) = root {
        return topology
            .find_decoder(name)
            .with_context(|| format!("looking up root decoder {name}"));
    }
    match topology.root_decoders().as_slice() {
        [only] => Ok(only.handle()),
        [] => bail!("the topology has no root decoders"),
        many => bail!(
            "{} root decoders present, choose one with --root",
            many.len()
        ),
    }
}

/// Creates a region under the plan's root decoder, configures it, and binds it.
///
/// The region is deleted again when configuration or bind fails, so a
/// failed plan leaves nothing behind.
///
/// # Errors
///
/// Returns the failing step with context.
pub fn create_and_bind(topology: &Topology, plan: &RegionPlan) -> Result<Arc<Region>> {
    let root = resolve_root(topology, plan.root.as_deref())?;
    let name = create_region_name(topology, root).context("reserving a region name")?;
    let region =
        create_region(topology, root, &name).with_context(|| format!("creating {name}"))?;
    let outcome = configure(topology, &region, plan).and_then(|()| {
        bind_region(topology, region.handle()).with_context(|| format!("binding {name}"))
    });
    if let Err(err) = outcome {
        if let Err(cleanup) = remove_region(topology, region.handle()) {
            debug!(region = %name, error = %cleanup, "cleanup after failed bind");
        }
        return Err(err);
    }
    Ok(region)
}

fn configure(topology: &Topology, region: &Region, plan: &RegionPlan) -> Result<()> {
    let name = region.name();
    let ways = u32::try_from(plan.targets.len()).context("too many targets")?;
    region
        .set_granularity(plan.granularity)
        .with_context(|| format!("setting granularity of {name}"))?;
    region
        .set_ways(ways)
        .with_context(|| format!("setting interleave ways of {name}"))?;
    for (position, target) in plan.targets.iter().enumerate() {
        let memdev = topology
            .find_memdev(target)
            .with_context(|| format!("resolving target {position} of {name}"))?;
        region
            .set_target(position, Some(memdev))
            .with_context(|| format!("setting target {position} of {name}"))?;
    }
    region
        .set_size(plan.size)
        .with_context(|| format!("setting size of {name}"))?;
    if let Some(uuid) = &plan.uuid {
        region
            .set_uuid_str(uuid)
            .with_context(|| format!("setting uuid of {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{build, ByteSize, CommitMode, TopologyFile};

    const TWO_WAY: &str = r#"{
        "timing": { "settle_delay_ms": 0 },
        "host_bridges": [
            {
                "name": "pci0000:00",
                "dport": 0,
                "hdm": { "decoders": 2 },
                "root_ports": [
                    { "id": 0, "memdevs": [ { "name": "mem0", "capacity": "1G" } ] },
                    { "id": 1, "memdevs": [ { "name": "mem1", "capacity": "1G" } ] }
                ]
            }
        ],
        "root_decoders": [
            { "base": "0x1000000000", "size": "4G", "granularity": 256, "targets": [0] }
        ],
        "regions": [
            { "granularity": 256, "targets": ["mem0", "mem1"], "size": "512M" }
        ]
    }"#;

    #[test]
    fn parses_sizes_and_defaults() {
        let file: TopologyFile = serde_json::from_str(TWO_WAY).expect("parse");
        assert_eq!(file.root, "ACPI0017:00");
        assert_eq!(file.root_decoders[0].base, ByteSize(0x10_0000_0000));
        assert_eq!(file.root_decoders[0].size, ByteSize(4 << 30));
        let memdev = &file.host_bridges[0].root_ports[0].memdevs[0];
        assert!(memdev.bound);
        assert_eq!(memdev.decoders, 1);
        assert_eq!(memdev.commit, CommitMode::Immediate);
    }

    #[test]
    fn builds_and_binds_declared_regions() {
        let file: TopologyFile = serde_json::from_str(TWO_WAY).expect("parse");
        let fabric = build(&file).expect("build");
        assert_eq!(fabric.regions.len(), 1);
        let config = fabric.regions[0].config();
        assert!(config.active);
        assert_eq!(config.size, 512 << 20);
        assert_eq!(fabric.topology.memdevs().len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = TWO_WAY.replace("\"timing\"", "\"timings\"");
        assert!(serde_json::from_str::<TopologyFile>(&text).is_err());
    }

    #[test]
    fn bad_size_strings_fail_to_parse() {
        let text = TWO_WAY.replace("\"512M\"", "\"512Q\"");
        let err = serde_json::from_str::<TopologyFile>(&text).expect_err("bad size");
        assert!(err.to_string().contains("512Q"));
    }
}
