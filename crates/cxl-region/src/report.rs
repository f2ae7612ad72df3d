//! Snapshot of a live topology for `list` and `bind` output.

use std::fmt;

use cxl_core::{DecoderFlags, HdmCaps, HpaRange, Region, Topology};
use serde::Serialize;

/// Whole-fabric snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyReport {
    /// Every port, root first.
    pub ports: Vec<PortReport>,
    /// Every memory device.
    pub memdevs: Vec<MemdevReport>,
    /// Every live region.
    pub regions: Vec<RegionReport>,
}

/// One port with its decoders.
#[derive(Debug, Clone, Serialize)]
pub struct PortReport {
    /// Port name.
    pub name: String,
    /// Upstream device name.
    pub uport: String,
    /// Distance from the root.
    pub depth: u32,
    /// Decoder block capabilities, when the port has registers.
    pub hdm: Option<HdmCaps>,
    /// Decoders in slot order.
    pub decoders: Vec<DecoderReport>,
}

/// One decoder.
#[derive(Debug, Clone, Serialize)]
pub struct DecoderReport {
    /// Decoder name.
    pub name: String,
    /// `root`, `switch` or `endpoint`.
    pub kind: String,
    /// Interleave ways.
    pub ways: u32,
    /// Interleave granularity in bytes.
    pub granularity: u32,
    /// Decoded host physical range.
    pub range: Option<HpaRange>,
    /// Committed and decoding.
    pub enabled: bool,
    /// Owning region name.
    pub region: Option<String>,
    /// Target list, for root and switch decoders.
    pub targets: Vec<u32>,
}

/// One memory device.
#[derive(Debug, Clone, Serialize)]
pub struct MemdevReport {
    /// Device name.
    pub name: String,
    /// Endpoint port name.
    pub endpoint: String,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Unallocated capacity in bytes.
    pub free: u64,
    /// Driver bound.
    pub bound: bool,
}

/// One region.
#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
    /// Region name.
    pub name: String,
    /// Region UUID.
    pub uuid: String,
    /// Size in bytes.
    pub size: u64,
    /// Interleave ways.
    pub ways: u32,
    /// Interleave granularity in bytes.
    pub granularity: u32,
    /// Memory device names in position order.
    pub targets: Vec<String>,
    /// Reserved host physical range.
    pub res: Option<HpaRange>,
    /// Bound to hardware.
    pub active: bool,
    /// Committed decoders, in commit order.
    pub decoders: Vec<String>,
}

impl TopologyReport {
    /// Captures the current state of `topology`.
    #[must_use]
    pub fn capture(topology: &Topology) -> Self {
        let ports = topology
            .ports()
            .iter()
            .map(|port| PortReport {
                name: port.name().to_owned(),
                uport: port.uport().to_owned(),
                depth: port.depth(),
                hdm: port.hdm().map(cxl_core::Hdm::caps),
                decoders: topology
                    .decoders_of(port.id())
                    .unwrap_or_default()
                    .iter()
                    .map(|decoder| {
                        let state = decoder.lock().clone();
                        let range = state
                            .range
                            .or_else(|| decoder.as_root().ok().map(|root| root.window()));
                        DecoderReport {
                            name: decoder.name().to_owned(),
                            kind: decoder.kind().to_string(),
                            ways: state.interleave_ways,
                            granularity: state.interleave_granularity,
                            range,
                            enabled: state.flags.contains(DecoderFlags::ENABLE),
                            region: state
                                .region
                                .and_then(|handle| topology.region(handle).ok())
                                .map(|region| region.name().to_owned()),
                            targets: decoder
                                .targets()
                                .map(cxl_core::TargetList::snapshot)
                                .unwrap_or_default(),
                        }
                    })
                    .collect(),
            })
            .collect();
        let memdevs = topology
            .memdevs()
            .iter()
            .map(|memdev| MemdevReport {
                name: memdev.name().to_owned(),
                endpoint: topology
                    .port(memdev.endpoint())
                    .map(|port| port.name().to_owned())
                    .unwrap_or_default(),
                capacity: memdev.capacity(),
                free: memdev.free_capacity(),
                bound: memdev.is_bound(),
            })
            .collect();
        let regions = topology
            .regions()
            .iter()
            .map(|region| RegionReport::capture(topology, region))
            .collect();
        Self {
            ports,
            memdevs,
            regions,
        }
    }
}

impl RegionReport {
    /// Captures one region.
    #[must_use]
    pub fn capture(topology: &Topology, region: &Region) -> Self {
        let (config, committed) = {
            let state = region.lock();
            (state.config(), state.committed.clone())
        };
        Self {
            name: region.name().to_owned(),
            uuid: config.uuid.to_string(),
            size: config.size,
            ways: config.interleave_ways,
            granularity: config.interleave_granularity,
            targets: config
                .targets
                .iter()
                .map(|target| {
                    target
                        .and_then(|id| topology.memdev(id).ok())
                        .map_or_else(|| "-".to_owned(), |memdev| memdev.name().to_owned())
                })
                .collect(),
            res: config.res,
            active: config.active,
            decoders: committed
                .into_iter()
                .filter_map(|id| topology.decoder(id).ok())
                .map(|decoder| decoder.name().to_owned())
                .collect(),
        }
    }
}

struct Range(Option<HpaRange>);

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(range) if !range.is_empty() => {
                write!(f, "[{:#x}-{:#x}]", range.start, range.end() - 1)
            }
            _ => f.write_str("[unmapped]"),
        }
    }
}

impl fmt::Display for TopologyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for port in &self.ports {
            let indent = "  ".repeat(port.depth as usize);
            write!(f, "{indent}{} ({})", port.name, port.uport)?;
            if let Some(caps) = port.hdm {
                write!(
                    f,
                    " hdm: {} decoders, {} targets",
                    caps.decoder_count, caps.target_count
                )?;
            }
            writeln!(f)?;
            for decoder in &port.decoders {
                write!(
                    f,
                    "{indent}  {} {} x{} @{} {}",
                    decoder.name,
                    decoder.kind,
                    decoder.ways,
                    decoder.granularity,
                    Range(decoder.range)
                )?;
                if decoder.enabled {
                    f.write_str(" enabled")?;
                }
                if let Some(region) = &decoder.region {
                    write!(f, " -> {region}")?;
                }
                writeln!(f)?;
            }
        }
        for memdev in &self.memdevs {
            writeln!(
                f,
                "{} on {}: {:#x} bytes, {:#x} free{}",
                memdev.name,
                memdev.endpoint,
                memdev.capacity,
                memdev.free,
                if memdev.bound { "" } else { " (unbound)" }
            )?;
        }
        for region in &self.regions {
            write!(f, "{region}")?;
        }
        Ok(())
    }
}

impl fmt::Display for RegionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} size {:#x} x{} @{} {} {}",
            self.name,
            self.uuid,
            self.size,
            self.ways,
            self.granularity,
            Range(self.res),
            if self.active { "active" } else { "inactive" }
        )?;
        writeln!(f, "  targets: {}", self.targets.join(" "))?;
        if !self.decoders.is_empty() {
            writeln!(f, "  decoders: {}", self.decoders.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Range, TopologyReport};
    use crate::topology_file::{build, TopologyFile};
    use cxl_core::HpaRange;

    const SINGLE: &str = r#"{
        "timing": { "settle_delay_ms": 0 },
        "host_bridges": [
            {
                "name": "pci0000:00",
                "dport": 0,
                "hdm": {},
                "root_ports": [ { "id": 0, "memdevs": [ { "name": "mem0", "capacity": "512M" } ] } ]
            }
        ],
        "root_decoders": [
            { "base": "0x1000000000", "size": "1G", "granularity": 256, "targets": [0] }
        ],
        "regions": [ { "granularity": 256, "targets": ["mem0"], "size": "256M" } ]
    }"#;

    #[test]
    fn ranges_render_inclusive() {
        let range = Range(Some(HpaRange::new(0x1000, 0x1000)));
        assert_eq!(range.to_string(), "[0x1000-0x1fff]");
        assert_eq!(Range(None).to_string(), "[unmapped]");
    }

    #[test]
    fn capture_reports_bound_region_and_decoders() {
        let file: TopologyFile = serde_json::from_str(SINGLE).expect("parse");
        let fabric = build(&file).expect("build");
        let report = TopologyReport::capture(&fabric.topology);

        assert_eq!(report.regions.len(), 1);
        let region = &report.regions[0];
        assert!(region.active);
        assert_eq!(region.targets, ["mem0"]);
        assert_eq!(region.decoders.len(), 2);
        assert_eq!(report.memdevs[0].free, 256 << 20);

        let enabled = report
            .ports
            .iter()
            .flat_map(|port| &port.decoders)
            .filter(|decoder| decoder.enabled && decoder.kind != "root")
            .count();
        assert_eq!(enabled, 2);

        let text = report.to_string();
        assert!(text.contains(&region.name));
        assert!(text.contains("mem0 on endpoint"));

        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["regions"][0]["active"], true);
    }
}
