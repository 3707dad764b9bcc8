/*
* io_uring carries a 64-bit user_data value per submission. The dispatcher uses it to find
* which registration a completion belongs to:
*
* 1. Which registration slot, an index into the dispatcher's registration vector.
*
* 2. Which arm generation. Every time interest changes the poll is cancelled and the
*    generation bumped, so completions from a cancelled poll can be recognised and dropped.
*
* 3. Which operation - a readiness poll or the removal of one.
*/

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpCode {
    Poll       = 1,
    PollRemove = 2,
}

impl OpCode {
    #[inline]
    pub fn try_from_u8(v: u8) -> Option<Self> {
        use OpCode::*;
        Some(match v {
            1 => Poll,
            2 => PollRemove,
            _ => return None,
        })
    }
}

const OPCODE_BITS: u64 = 8;
const GEN_BITS:    u64 = 24;
const SLOT_BITS:   u64 = 64 - (OPCODE_BITS + GEN_BITS);

const OPCODE_MASK: u64 = (1 << OPCODE_BITS) - 1;              // 0xFF
const GEN_MASK:    u64 = (1 << GEN_BITS) - 1;                 // 0xFF_FFFF
const SLOT_MASK:   u64 = (1 << SLOT_BITS) - 1;                // 0xFFFF_FFFF

const OPCODE_SHIFT: u64 = 0;
const GEN_SHIFT:    u64 = OPCODE_SHIFT + OPCODE_BITS;         // 8
const SLOT_SHIFT:   u64 = GEN_SHIFT + GEN_BITS;               // 32

/// Generations wrap inside the packed field.
#[inline]
pub fn next_generation(generation: u32) -> u32 {
    ((generation as u64 + 1) & GEN_MASK) as u32
}

#[inline]
pub fn pack_user_data(slot: usize, generation: u32, op: OpCode) -> u64 {
    let slot = slot as u64;
    debug_assert!((slot & !SLOT_MASK) == 0, "slot exceeds 32 bits");

    ((slot & SLOT_MASK) << SLOT_SHIFT)
    | (((generation as u64) & GEN_MASK) << GEN_SHIFT)
    | ((op as u64) & OPCODE_MASK)
}

#[inline]
pub fn unpack_user_data(tag: u64) -> Option<(usize, u32, OpCode)> {
    let slot = ((tag >> SLOT_SHIFT) & SLOT_MASK) as usize;
    let generation = ((tag >> GEN_SHIFT) & GEN_MASK) as u32;
    let op = OpCode::try_from_u8(((tag >> OPCODE_SHIFT) & OPCODE_MASK) as u8)?;
    Some((slot, generation, op))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_slot_generation_and_op() {
        let tag = pack_user_data(77, 5, OpCode::Poll);
        assert_eq!(unpack_user_data(tag), Some((77, 5, OpCode::Poll)));

        let tag = pack_user_data(0, 0, OpCode::PollRemove);
        assert_eq!(unpack_user_data(tag), Some((0, 0, OpCode::PollRemove)));
    }

    #[test]
    fn generation_wraps_within_field() {
        let top = GEN_MASK as u32;
        assert_eq!(next_generation(top), 0);
        let tag = pack_user_data(3, top, OpCode::Poll);
        assert_eq!(unpack_user_data(tag), Some((3, top, OpCode::Poll)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(unpack_user_data(0), None);
    }
}
