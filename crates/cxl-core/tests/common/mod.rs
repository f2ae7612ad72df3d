//! Shared fabric builder for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cxl_core::{
    create_region, create_region_name, enumerate_decoders, ComponentRegs, CxlConfig, DecoderFlags,
    DecoderId, HpaRange, MemdevId, PortId, Region, RootDecoderDesc, SimHdm, Topology,
    REGION_ALIGN,
};

pub const WINDOW_BASE: u64 = 0x10_0000_0000;
pub const WINDOW_SIZE: u64 = 16 * REGION_ALIGN;
pub const MEMDEV_CAPACITY: u64 = 4 * REGION_ALIGN;

pub struct Endpoint {
    pub port: PortId,
    pub memdev: MemdevId,
    pub regs: Arc<SimHdm>,
}

pub struct HostBridge {
    pub port: PortId,
    pub regs: Arc<SimHdm>,
}

pub struct Fabric {
    pub topo: Topology,
    pub root: PortId,
    pub root_decoder: DecoderId,
    pub host_bridges: Vec<HostBridge>,
    pub endpoints: Vec<Endpoint>,
}

/// Test timing: no settle delay, short commit timeout.
pub fn fast_config() -> CxlConfig {
    CxlConfig {
        commit_timeout: Duration::from_millis(5),
        ..CxlConfig::immediate()
    }
}

/// Builds root -> host bridges -> root ports -> endpoints.
///
/// `layout[b][r]` is the number of endpoints below root port `r` of host
/// bridge `b`. The root decoder interleaves across every bridge in order
/// at `root_granularity`. Endpoints are numbered `mem0..` in layout order
/// and come up driver-bound.
pub fn fabric(layout: &[&[usize]], root_granularity: u32) -> Fabric {
    fabric_with(layout, root_granularity, fast_config(), 2, 1)
}

pub fn fabric_with(
    layout: &[&[usize]],
    root_granularity: u32,
    config: CxlConfig,
    bridge_slots: u32,
    endpoint_slots: u32,
) -> Fabric {
    let topo = Topology::new(config);
    let root = topo.add_root_port("ACPI0017:00");
    let mut host_bridges = Vec::new();
    let mut endpoints = Vec::new();

    for (b, root_ports) in layout.iter().enumerate() {
        let b = b as u32;
        let bridge_name = format!("pci0000:{b:02x}");
        topo.add_dport(root, b, &bridge_name, None).expect("root dport");
        let regs = Arc::new(SimHdm::new(bridge_slots, 8));
        let hb = topo
            .add_port(
                root,
                b,
                &bridge_name,
                Some(ComponentRegs {
                    phys: 0xfe00_0000 + u64::from(b) * 0x1_0000,
                    io: regs.clone(),
                }),
            )
            .expect("host bridge");
        enumerate_decoders(&topo, hb).expect("bridge decoders");
        host_bridges.push(HostBridge { port: hb, regs });

        for (r, &count) in root_ports.iter().enumerate() {
            let r = r as u32;
            topo.add_dport(hb, r, &format!("0000:{b:02x}:{r:02x}.0"), None)
                .expect("root port");
            for _ in 0..count {
                let index = endpoints.len();
                let name = format!("mem{index}");
                let regs = Arc::new(SimHdm::new(endpoint_slots, 0));
                let ep = topo
                    .add_endpoint_port(
                        hb,
                        r,
                        &name,
                        Some(ComponentRegs {
                            phys: 0xfd00_0000 + index as u64 * 0x1_0000,
                            io: regs.clone(),
                        }),
                    )
                    .expect("endpoint port");
                enumerate_decoders(&topo, ep).expect("endpoint decoders");
                let memdev = topo
                    .add_memdev(&name, ep, MEMDEV_CAPACITY, 0)
                    .expect("memdev");
                topo.set_memdev_bound(memdev, true).expect("driver bound");
                endpoints.push(Endpoint {
                    port: ep,
                    memdev,
                    regs,
                });
            }
        }
    }

    let root_decoder = topo
        .add_root_decoder(
            root,
            RootDecoderDesc {
                window: HpaRange::new(WINDOW_BASE, WINDOW_SIZE),
                interleave_ways: layout.len() as u32,
                interleave_granularity: root_granularity,
                flags: DecoderFlags::PMEM | DecoderFlags::TYPE3,
                qtg_id: 0,
                targets: (0..layout.len() as u32).collect(),
            },
        )
        .expect("root decoder");

    Fabric {
        topo,
        root,
        root_decoder,
        host_bridges,
        endpoints,
    }
}

impl Fabric {
    /// Creates a region and configures it with the given endpoints in position order.
    pub fn region(&self, granularity: u32, targets: &[usize], size: u64) -> Arc<Region> {
        self.region_on(self.root_decoder, granularity, targets, size)
    }

    /// Same as [`Fabric::region`] under an arbitrary root decoder.
    pub fn region_on(
        &self,
        root_decoder: DecoderId,
        granularity: u32,
        targets: &[usize],
        size: u64,
    ) -> Arc<Region> {
        let name = create_region_name(&self.topo, root_decoder).expect("region name");
        let region = create_region(&self.topo, root_decoder, &name).expect("create region");
        region.set_granularity(granularity).expect("granularity");
        region.set_ways(targets.len() as u32).expect("ways");
        for (position, &endpoint) in targets.iter().enumerate() {
            region
                .set_target(position, Some(self.endpoints[endpoint].memdev))
                .expect("target");
        }
        region.set_size(size).expect("size");
        region
    }

    pub fn window_available(&self) -> u64 {
        self.topo
            .decoder(self.root_decoder)
            .expect("root decoder")
            .as_root()
            .expect("root payload")
            .resources()
            .available()
    }

    /// Decoders currently claimed by any region.
    pub fn claimed_decoders(&self) -> usize {
        self.topo
            .ports()
            .iter()
            .flat_map(|port| self.topo.decoders_of(port.id()).expect("decoders"))
            .filter(|decoder| decoder.lock().region.is_some())
            .count()
    }

    /// Decoders with the software enable flag set, excluding root windows.
    pub fn enabled_decoders(&self) -> usize {
        self.topo
            .ports()
            .iter()
            .filter(|port| !port.is_root())
            .flat_map(|port| self.topo.decoders_of(port.id()).expect("decoders"))
            .filter(|decoder| decoder.lock().flags.contains(DecoderFlags::ENABLE))
            .count()
    }
}
