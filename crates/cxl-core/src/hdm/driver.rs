//! Decoder commit, disable, and enumeration against HDM registers.
//!
//! Ports without an HDM block are decoded in software: commit and disable
//! only flip the enable flag.

use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::regs::{
    self, BASE_SIZE_LOW_MASK, CTRL_COMMIT, CTRL_COMMITTED, CTRL_COMMIT_ERROR, CTRL_IG_MASK,
    CTRL_IW_MASK, CTRL_LOCK, CTRL_TYPE, MAX_TARGET_LIST,
};
use super::HdmIo;
use crate::config::CxlConfig;
use crate::error::{CxlError, Result};
use crate::interleave::{
    encoding_from_granularity, encoding_from_ways, granularity_from_encoding, ways_from_encoding,
};
use crate::resource::HpaRange;
use crate::topology::{
    DecoderFlags, DecoderId, DecoderState, DecoderVariant, Port, PortId, TargetType, Topology,
};

/// Programs a decoder's configuration into its slot and waits for hardware to accept it.
///
/// Registers are written target list first, then size, then base, each
/// high half before low, with the control register last. Decoders without
/// targets get a zeroed target list.
///
/// # Errors
///
/// Returns [`CxlError::InvalidEnableState`] when the decoder is already
/// enabled, [`CxlError::DecoderActive`] when the slot is committed with a
/// live size, [`CxlError::CommitError`] or [`CxlError::CommitTimeout`] when
/// hardware does not accept the commit, [`CxlError::TargetIdOutOfRange`]
/// for a target port id wider than a target-list entry, and
/// [`CxlError::Mmio`] on register access failure.
pub fn commit_decoder(topology: &Topology, handle: DecoderId) -> Result<()> {
    let decoder = topology.decoder(handle)?;
    let port = topology.port(decoder.port())?;
    let targets = decoder.targets().map(crate::topology::TargetList::snapshot);
    let mut state = decoder.lock();

    if state.flags.contains(DecoderFlags::ENABLE) {
        return Err(CxlError::InvalidEnableState {
            decoder: decoder.name().to_owned(),
            operation: "commit",
        });
    }

    let Some(hdm) = port.hdm() else {
        state.flags.insert(DecoderFlags::ENABLE);
        debug!(decoder = decoder.name(), "passthrough decoder enabled");
        return Ok(());
    };
    let io = hdm.io();
    let slot = decoder.id();

    let ctrl = io.read32(regs::ctrl_offset(slot))?;
    let size = io.read64_hi_lo(regs::size_low_offset(slot))?;
    if ctrl & CTRL_COMMITTED != 0 && size != 0 {
        return Err(CxlError::DecoderActive {
            decoder: decoder.name().to_owned(),
        });
    }

    let range = state.range.ok_or_else(|| CxlError::UnconfiguredDecoder {
        decoder: decoder.name().to_owned(),
    })?;
    let ig = encoding_from_granularity(state.interleave_granularity).ok_or(
        CxlError::InvalidGranularity {
            granularity: state.interleave_granularity,
        },
    )?;
    let eniw = encoding_from_ways(state.interleave_ways).ok_or(CxlError::InvalidWays {
        ways: state.interleave_ways,
    })?;

    let mut ctrl = ctrl & !(CTRL_IG_MASK | CTRL_IW_MASK | CTRL_TYPE);
    ctrl |= regs::field_prep(CTRL_IG_MASK, u32::from(ig));
    ctrl |= regs::field_prep(CTRL_IW_MASK, u32::from(eniw));
    ctrl |= CTRL_COMMIT;
    if state.target_type == TargetType::Expander {
        ctrl |= CTRL_TYPE;
    }

    let (tl_low, tl_high) = match targets.filter(|ids| !ids.is_empty()) {
        Some(ids) => pack_targets(&ids, state.interleave_ways)?,
        None => (0, 0),
    };
    io.write32(regs::target_list_high_offset(slot), tl_high)?;
    io.write32(regs::target_list_low_offset(slot), tl_low)?;
    let (size_low, size_high) = split_address(range.size);
    let (base_low, base_high) = split_address(range.start);
    io.write32(regs::size_high_offset(slot), size_high)?;
    io.write32(regs::size_low_offset(slot), size_low)?;
    io.write32(regs::base_high_offset(slot), base_high)?;
    io.write32(regs::base_low_offset(slot), base_low)?;
    io.write32(regs::ctrl_offset(slot), ctrl)?;

    wait_for_commit(io, slot, topology.config(), decoder.name())?;
    state.flags.insert(DecoderFlags::ENABLE);
    debug!(
        decoder = decoder.name(),
        depth = port.depth(),
        range = %range,
        ways = state.interleave_ways,
        granularity = state.interleave_granularity,
        "decoder committed"
    );
    Ok(())
}

/// Clears a decoder's slot and marks it disabled.
///
/// The software enable flag is cleared before any register is touched. A
/// slot that was committed is re-committed with zero size so hardware stops
/// decoding the old range.
///
/// # Errors
///
/// Returns [`CxlError::InvalidEnableState`] when the decoder is not enabled,
/// or [`CxlError::Mmio`] on register access failure.
pub fn disable_decoder(topology: &Topology, handle: DecoderId) -> Result<()> {
    let decoder = topology.decoder(handle)?;
    let port = topology.port(decoder.port())?;
    let mut state = decoder.lock();

    if !state.flags.contains(DecoderFlags::ENABLE) {
        return Err(CxlError::InvalidEnableState {
            decoder: decoder.name().to_owned(),
            operation: "disable",
        });
    }
    state.flags.remove(DecoderFlags::ENABLE);

    let Some(hdm) = port.hdm() else {
        debug!(decoder = decoder.name(), "passthrough decoder disabled");
        return Ok(());
    };
    let io = hdm.io();
    let slot = decoder.id();

    let ctrl = io.read32(regs::ctrl_offset(slot))?;
    for offset in [
        regs::target_list_high_offset(slot),
        regs::target_list_low_offset(slot),
        regs::size_high_offset(slot),
        regs::size_low_offset(slot),
        regs::base_high_offset(slot),
        regs::base_low_offset(slot),
    ] {
        io.write32(offset, 0)?;
    }
    if ctrl & CTRL_COMMITTED != 0 {
        io.write32(regs::ctrl_offset(slot), CTRL_COMMIT)?;
    }
    debug!(decoder = decoder.name(), "decoder disabled");
    Ok(())
}

/// Reads every slot of a port's HDM block and registers a decoder for each usable one.
///
/// Slots that fail to parse are skipped with a warning. When any slot is not
/// yet committed, enumeration waits once for the configured settle delay
/// before reading so firmware programming can land.
///
/// # Errors
///
/// Returns [`CxlError::NoHdmRegisters`] for a port without an HDM block,
/// [`CxlError::NoValidDecoders`] when every slot fails, and
/// [`CxlError::Mmio`] when the committed-state sampling fails.
pub fn enumerate_decoders(topology: &Topology, port_id: PortId) -> Result<Vec<DecoderId>> {
    let port = topology.port(port_id)?;
    let hdm = port.hdm().ok_or_else(|| CxlError::NoHdmRegisters {
        port: port.name().to_owned(),
    })?;
    let io = hdm.io();
    let caps = hdm.caps();

    let mut committed = 0;
    for slot in 0..caps.decoder_count {
        if io.read32(regs::ctrl_offset(slot))? & CTRL_COMMITTED != 0 {
            committed += 1;
        }
    }
    if committed != caps.decoder_count {
        debug!(
            port = port.name(),
            committed,
            slots = caps.decoder_count,
            "waiting for decoder settle"
        );
        thread::sleep(topology.config().settle_delay);
    }

    let mut added = Vec::new();
    for slot in 0..caps.decoder_count {
        let parsed = read_slot(io, &port, slot, caps.target_count)
            .and_then(|(state, variant)| topology.insert_decoder(&port, slot, state, variant));
        match parsed {
            Ok(handle) => added.push(handle),
            Err(err) => warn!(port = port.name(), slot, error = %err, "skipping decoder slot"),
        }
    }
    if added.is_empty() {
        error!(port = port.name(), "no valid decoders");
        return Err(CxlError::NoValidDecoders {
            port: port.name().to_owned(),
        });
    }
    info!(port = port.name(), decoders = added.len(), "enumerated decoders");
    Ok(added)
}

fn read_slot(
    io: &dyn HdmIo,
    port: &Port,
    slot: u32,
    target_count: u32,
) -> Result<(DecoderState, DecoderVariant)> {
    let name = format!("decoder{}.{slot}", port.id());
    let corrupt = |reason: &'static str| CxlError::CorruptDecoder {
        decoder: name.clone(),
        reason,
    };

    let ctrl = io.read32(regs::ctrl_offset(slot))?;
    let base = io.read64_hi_lo(regs::base_low_offset(slot))?;
    let mut size = io.read64_hi_lo(regs::size_low_offset(slot))?;
    let committed = ctrl & CTRL_COMMITTED != 0;
    if !committed {
        size = 0;
    }
    if base == u64::MAX || size == u64::MAX {
        return Err(corrupt("all-ones base or size"));
    }

    let mut flags = DecoderFlags::empty();
    if committed {
        flags.insert(DecoderFlags::ENABLE);
        if ctrl & CTRL_LOCK != 0 {
            flags.insert(DecoderFlags::LOCK);
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let eniw = regs::field_get(CTRL_IW_MASK, ctrl) as u8;
    let ways = ways_from_encoding(eniw).ok_or_else(|| corrupt("reserved ways encoding"))?;
    #[allow(clippy::cast_possible_truncation)]
    let ig = regs::field_get(CTRL_IG_MASK, ctrl) as u8;
    let granularity =
        granularity_from_encoding(ig).ok_or_else(|| corrupt("reserved granularity encoding"))?;
    // Idle slots carry no type; they default to host-only memory expanders.
    let target_type = if !committed || ctrl & CTRL_TYPE != 0 {
        TargetType::Expander
    } else {
        TargetType::Accelerator
    };
    let state = DecoderState {
        interleave_ways: ways,
        interleave_granularity: granularity,
        target_type,
        flags,
        range: (size != 0).then_some(HpaRange::new(base, size)),
        region: None,
    };

    if port.is_endpoint() {
        return Ok((state, DecoderVariant::endpoint()));
    }

    let capacity = (target_count as usize).min(MAX_TARGET_LIST);
    let mut targets = Vec::new();
    if committed {
        let low = io.read32(regs::target_list_low_offset(slot))?;
        let high = io.read32(regs::target_list_high_offset(slot))?;
        let ids = regs::unpack_target_list(low, high, ways as usize);
        let port_state = port.lock();
        for id in ids.into_iter().map(u32::from) {
            if port_state.dport(id).is_none() {
                return Err(CxlError::UnknownDport {
                    port: port.name().to_owned(),
                    dport: id,
                });
            }
            targets.push(id);
        }
    }
    Ok((state, DecoderVariant::switch(capacity.max(targets.len()), &targets)?))
}

fn pack_targets(ids: &[u32], ways: u32) -> Result<(u32, u32)> {
    let used = &ids[..ids.len().min(ways as usize)];
    if used.len() > MAX_TARGET_LIST {
        return Err(CxlError::TooManyTargets {
            count: used.len(),
            capacity: MAX_TARGET_LIST,
        });
    }
    let bytes = used
        .iter()
        .map(|&id| u8::try_from(id).map_err(|_| CxlError::TargetIdOutOfRange { id }))
        .collect::<Result<Vec<u8>>>()?;
    Ok(regs::pack_target_list(&bytes))
}

#[allow(clippy::cast_possible_truncation)]
const fn split_address(value: u64) -> (u32, u32) {
    (BASE_SIZE_LOW_MASK & value as u32, (value >> 32) as u32)
}

fn wait_for_commit(io: &dyn HdmIo, slot: u32, config: &CxlConfig, decoder: &str) -> Result<()> {
    let deadline = Instant::now() + config.commit_timeout;
    loop {
        let ctrl = io.read32(regs::ctrl_offset(slot))?;
        if ctrl & CTRL_COMMITTED != 0 {
            return Ok(());
        }
        if ctrl & CTRL_COMMIT_ERROR != 0 {
            error!(decoder, ctrl, "decoder commit error");
            return Err(CxlError::CommitError {
                decoder: decoder.to_owned(),
                ctrl,
            });
        }
        if Instant::now() >= deadline {
            error!(decoder, ctrl, timeout = ?config.commit_timeout, "decoder commit timed out");
            return Err(CxlError::CommitTimeout {
                decoder: decoder.to_owned(),
                ctrl,
                timeout: config.commit_timeout,
            });
        }
        thread::sleep(config.commit_poll_interval);
    }
}
