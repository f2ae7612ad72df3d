//! HDM decoder capability register layout and bit fields.

/// Size of a component register block mapping.
pub const COMPONENT_REG_BLOCK_SIZE: u32 = 64 * 1024;

/// Capability register offset.
pub const HDM_DECODER_CAP_OFFSET: u32 = 0x0;
/// Decoder count field of the capability register.
pub const HDM_DECODER_COUNT_MASK: u32 = 0x0000_000F;
/// Target count field of the capability register.
pub const HDM_DECODER_TARGET_COUNT_MASK: u32 = 0x0000_00F0;
/// Address bits 11:8 usable for interleave selection.
pub const HDM_DECODER_INTERLEAVE_11_8: u32 = 1 << 8;
/// Address bits 14:12 usable for interleave selection.
pub const HDM_DECODER_INTERLEAVE_14_12: u32 = 1 << 9;

/// Global control register offset.
pub const HDM_DECODER_CTRL_OFFSET: u32 = 0x4;
/// Global decoder enable bit.
pub const HDM_DECODER_ENABLE: u32 = 1 << 1;

/// Byte stride between consecutive decoder slots.
pub const HDM_DECODER_STRIDE: u32 = 0x20;

/// Interleave granularity field of a slot control register.
pub const CTRL_IG_MASK: u32 = 0x0000_000F;
/// Interleave ways field of a slot control register.
pub const CTRL_IW_MASK: u32 = 0x0000_00F0;
/// Slot is locked against reprogramming.
pub const CTRL_LOCK: u32 = 1 << 8;
/// Software commit request.
pub const CTRL_COMMIT: u32 = 1 << 9;
/// Hardware commit acknowledgement.
pub const CTRL_COMMITTED: u32 = 1 << 10;
/// Hardware commit failure.
pub const CTRL_COMMIT_ERROR: u32 = 1 << 11;
/// Target type: set for memory expanders, clear for accelerators.
pub const CTRL_TYPE: u32 = 1 << 12;

/// Address bits the base and size low registers carry.
pub const BASE_SIZE_LOW_MASK: u32 = 0xF000_0000;
/// Target entries packed into one target-list register.
pub const TARGETS_PER_REGISTER: usize = 4;
/// Target entries the two target-list registers hold.
pub const MAX_TARGET_LIST: usize = 2 * TARGETS_PER_REGISTER;

/// Base-address low register of slot `slot`.
#[must_use]
pub const fn base_low_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x10
}

/// Base-address high register of slot `slot`.
#[must_use]
pub const fn base_high_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x14
}

/// Size low register of slot `slot`.
#[must_use]
pub const fn size_low_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x18
}

/// Size high register of slot `slot`.
#[must_use]
pub const fn size_high_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x1c
}

/// Control register of slot `slot`.
#[must_use]
pub const fn ctrl_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x20
}

/// Target-list low register of slot `slot`.
#[must_use]
pub const fn target_list_low_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x24
}

/// Target-list high register of slot `slot`.
#[must_use]
pub const fn target_list_high_offset(slot: u32) -> u32 {
    HDM_DECODER_STRIDE * slot + 0x28
}

/// Extracts the field selected by `mask` from `value`.
#[must_use]
pub const fn field_get(mask: u32, value: u32) -> u32 {
    (value & mask) >> mask.trailing_zeros()
}

/// Places `field` into the bits selected by `mask`.
#[must_use]
pub const fn field_prep(mask: u32, field: u32) -> u32 {
    (field << mask.trailing_zeros()) & mask
}

/// Decoder slots advertised by a capability register value.
///
/// A count field of zero means one decoder; any other value `n` means `2n`.
#[must_use]
pub const fn decoder_count(cap: u32) -> u32 {
    let field = field_get(HDM_DECODER_COUNT_MASK, cap);
    if field == 0 {
        1
    } else {
        field * 2
    }
}

/// Target-list entries per decoder advertised by a capability register value.
#[must_use]
pub const fn target_count(cap: u32) -> u32 {
    field_get(HDM_DECODER_TARGET_COUNT_MASK, cap)
}

/// Encodes `slots` into the capability count field, inverse of [`decoder_count`].
#[must_use]
pub const fn count_field(slots: u32) -> Option<u32> {
    match slots {
        1 => Some(0),
        2..=30 if slots.is_multiple_of(2) => Some(slots / 2),
        _ => None,
    }
}

/// Packs downstream port ids into the (low, high) target-list registers.
///
/// Entry `i` occupies byte `i % 4` of register `i / 4`; callers bound `ids` to
/// [`MAX_TARGET_LIST`].
#[must_use]
pub fn pack_target_list(ids: &[u8]) -> (u32, u32) {
    let mut words = [0_u32; 2];
    for (position, &id) in ids.iter().take(MAX_TARGET_LIST).enumerate() {
        let shift = (position % TARGETS_PER_REGISTER) * 8;
        words[position / TARGETS_PER_REGISTER] |= u32::from(id) << shift;
    }
    (words[0], words[1])
}

/// Unpacks the first `count` target entries from the target-list registers.
#[must_use]
pub fn unpack_target_list(low: u32, high: u32, count: usize) -> Vec<u8> {
    let bytes = [low.to_le_bytes(), high.to_le_bytes()];
    (0..count.min(MAX_TARGET_LIST))
        .map(|position| bytes[position / TARGETS_PER_REGISTER][position % TARGETS_PER_REGISTER])
        .collect()
}

const fn assert_slot_layout() {
    let mut slot = 0;
    while slot < 15 {
        assert!(target_list_high_offset(slot) < base_low_offset(slot + 1));
        assert!(ctrl_offset(slot) - base_low_offset(slot) == 0x10);
        slot += 1;
    }
    assert!(base_low_offset(0) > HDM_DECODER_CTRL_OFFSET);
}

const _: () = assert_slot_layout();
