#![no_main]

use std::sync::Arc;

use cxl_core::hdm::regs;
use cxl_core::{
    encoding_from_granularity, encoding_from_ways, enumerate_decoders, granularity_from_encoding,
    ways_from_encoding, ComponentRegs, CxlConfig, HdmCaps, SimHdm, Topology,
};
use libfuzzer_sys::fuzz_target;

fn word(data: &[u8], index: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    for (offset, byte) in bytes.iter_mut().enumerate() {
        *byte = data.get(index * 4 + offset).copied().unwrap_or(0);
    }
    u32::from_le_bytes(bytes)
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }

    let cap = word(data, 0);
    let _ = HdmCaps::parse(cap);
    let _ = regs::unpack_target_list(word(data, 1), word(data, 2), usize::from(data[0] % 9));
    if let Some(ways) = ways_from_encoding(data[1]) {
        assert_eq!(encoding_from_ways(ways), Some(data[1]));
    }
    if let Some(granularity) = granularity_from_encoding(data[2]) {
        assert_eq!(encoding_from_granularity(granularity), Some(data[2]));
    }

    // Fill a two-slot block with fuzz bytes and let enumeration parse it.
    let sim = Arc::new(SimHdm::new(2, 8));
    for slot in 0..2 {
        let base = 3 + slot as usize * 7;
        let offsets = [
            regs::base_low_offset(slot),
            regs::base_high_offset(slot),
            regs::size_low_offset(slot),
            regs::size_high_offset(slot),
            regs::ctrl_offset(slot),
            regs::target_list_low_offset(slot),
            regs::target_list_high_offset(slot),
        ];
        for (index, offset) in offsets.into_iter().enumerate() {
            sim.poke(offset, word(data, base + index));
        }
    }

    let topo = Topology::new(CxlConfig::immediate());
    let root = topo.add_root_port("ACPI0017:00");
    if topo.add_dport(root, 0, "pci0000:00", None).is_err() {
        return;
    }
    let Ok(hb) = topo.add_port(
        root,
        0,
        "pci0000:00",
        Some(ComponentRegs {
            phys: 0,
            io: sim.clone(),
        }),
    ) else {
        return;
    };
    for id in 0..4 {
        let _ = topo.add_dport(hb, id, "rp", None);
    }
    if let Ok(handles) = enumerate_decoders(&topo, hb) {
        for handle in handles {
            let decoder = topo.decoder(handle).expect("enumerated decoder exists");
            let state = decoder.lock();
            assert!(cxl_core::is_valid_ways(state.interleave_ways));
            assert!(cxl_core::is_valid_granularity(state.interleave_granularity));
        }
    }
});
