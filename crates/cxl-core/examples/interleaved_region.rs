//! Builds a two host bridge fabric over simulated HDM blocks and binds a
//! four-way interleaved region across it.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p cxl-core --example interleaved_region
//! ```
//!
//! Prints every decoder the bind programmed, then unbinds and shows the
//! window returned to the root decoder.

#![allow(clippy::pedantic)]

use std::sync::Arc;

use bitflags as _;
use cxl_core::{
    bind_region, create_region, create_region_name, enumerate_decoders, unbind_region,
    ComponentRegs, CxlConfig, DecoderFlags, HpaRange, MemdevId, Result, RootDecoderDesc, SimHdm,
    Topology, REGION_ALIGN,
};
use parking_lot as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use uuid as _;

const WINDOW: HpaRange = HpaRange::new(0x40_0000_0000, 64 * REGION_ALIGN);

fn regs(slots: u32, targets: u32, phys: u64) -> ComponentRegs {
    ComponentRegs {
        phys,
        io: Arc::new(SimHdm::new(slots, targets)),
    }
}

/// Two host bridges, two root ports each, one memory device per root port.
fn build() -> Result<(Topology, Vec<MemdevId>)> {
    let topo = Topology::new(CxlConfig::immediate());
    let root = topo.add_root_port("ACPI0017:00");
    let mut memdevs = Vec::new();
    for bridge in 0..2_u32 {
        let name = format!("pci0000:{bridge:02x}");
        topo.add_dport(root, bridge, &name, None)?;
        let hb = topo.add_port(root, bridge, &name, Some(regs(2, 8, 0xfe00_0000)))?;
        enumerate_decoders(&topo, hb)?;
        for rp in 0..2_u32 {
            topo.add_dport(hb, rp, &format!("0000:{bridge:02x}:{rp:02x}.0"), None)?;
            let mem = format!("mem{}", memdevs.len());
            let ep = topo.add_endpoint_port(hb, rp, &mem, Some(regs(1, 0, 0xfd00_0000)))?;
            enumerate_decoders(&topo, ep)?;
            let memdev = topo.add_memdev(&mem, ep, 4 * REGION_ALIGN, 0)?;
            topo.set_memdev_bound(memdev, true)?;
            memdevs.push(memdev);
        }
    }
    topo.add_root_decoder(
        root,
        RootDecoderDesc {
            window: WINDOW,
            interleave_ways: 2,
            interleave_granularity: 256,
            flags: DecoderFlags::PMEM | DecoderFlags::TYPE3,
            qtg_id: 0,
            targets: vec![0, 1],
        },
    )?;
    Ok((topo, memdevs))
}

fn main() -> Result<()> {
    let (topo, memdevs) = build()?;
    let root = topo.root_decoders()[0].handle();

    let name = create_region_name(&topo, root)?;
    let region = create_region(&topo, root, &name)?;
    region.set_granularity(256)?;
    region.set_ways(4)?;
    // root slot follows the low position bit: alternate bridges
    for (position, index) in [0, 2, 1, 3].into_iter().enumerate() {
        region.set_target(position, Some(memdevs[index]))?;
    }
    region.set_size(4 * REGION_ALIGN)?;
    bind_region(&topo, region.handle())?;

    let config = region.config();
    println!("{} uuid={} res={:?}", region.name(), config.uuid, config.res);
    for port in topo.ports().iter().filter(|port| !port.is_root()) {
        for decoder in topo.decoders_of(port.id())? {
            let state = decoder.lock();
            if state.region.is_none() {
                continue;
            }
            println!(
                "  {:<12} ways={:<2} granularity={:<5} targets={:?}",
                decoder.name(),
                state.interleave_ways,
                state.interleave_granularity,
                decoder.targets().map(|list| list.snapshot()).unwrap_or_default(),
            );
        }
    }

    unbind_region(&topo, region.handle())?;
    let available = topo.decoder(root)?.as_root()?.resources().available();
    println!("window free after unbind: {available:#x} of {:#x}", WINDOW.size);
    Ok(())
}
