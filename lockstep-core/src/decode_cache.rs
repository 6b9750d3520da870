//! Direct-mapped cache of pre-decoded operation records, indexed by PC.

use crate::decode::{self, Decoded};
use crate::op::{Op, Stage};
use crate::word::Word;

/// PC-indexed decode cache.
///
/// A line is either empty (raw word `0`, dispatch `Invalid`) or consistent: its raw word
/// matches what the decoder produced for it. Self-modifying code that rewrites an instruction
/// while keeping its raw word identical is indistinguishable from no change, which is
/// correct.
#[derive(Debug, Clone)]
pub struct DecodeCache {
    lines: Vec<(u32, Decoded)>,
    offset_bits: u32,
    /// Right shift applied to the PC before indexing; 2 for fixed 32-bit instructions.
    shamt: u32,
}

impl DecodeCache {
    /// The line count used by the system core: 4096 lines of 32-bit instructions.
    pub const DEFAULT_OFFSET_BITS: u32 = 12;

    pub fn new(offset_bits: u32, shamt: u32) -> Self {
        Self {
            lines: vec![(0, Decoded::INVALID); 1 << offset_bits],
            offset_bits,
            shamt,
        }
    }

    /// Drops all cached decodes, e.g. after a reset with fresh program memory.
    pub fn clear(&mut self) {
        self.lines.fill((0, Decoded::INVALID));
    }

    /// Advances a fetched record to the decode stage, reusing the cached decode when the
    /// line's raw word matches.
    pub fn decode<W: Word>(&mut self, op: &mut Op<W>) {
        debug_assert!(matches!(op.stage, Stage::Fetch));
        let index = (op.pc.to_u64() >> self.shamt) & ((1 << self.offset_bits) - 1);
        let line = &mut self.lines[index as usize];
        if line.0 == op.instr {
            op.stage = Stage::Decode(line.1);
        } else {
            let decoded = decode::decode(op.instr);
            *line = (op.instr, decoded);
            op.stage = Stage::Decode(decoded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Dispatch;

    fn fetched(pc: u32, instr: u32) -> Op<u32> {
        let mut op = Op::fetch_at(pc);
        op.instr = instr;
        op
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = DecodeCache::new(4, 2);
        // addi x1, x2, -3
        let mut op = fetched(0x8000_0000, 0xFFD1_0093);
        cache.decode(&mut op);
        let Stage::Decode(first) = op.stage else {
            panic!("expected decode stage");
        };
        assert_eq!(first.dispatch, Dispatch::Addi);

        let mut op = fetched(0x8000_0000, 0xFFD1_0093);
        cache.decode(&mut op);
        assert_eq!(op.stage, Stage::Decode(first));
    }

    #[test]
    fn test_conflicting_line_is_replaced() {
        let mut cache = DecodeCache::new(2, 2);
        // Two PCs four lines apart map to the same line.
        let mut op = fetched(0x0, 0xFFD1_0093); // addi
        cache.decode(&mut op);
        let mut op = fetched(0x10, 0x0020_81B3); // add
        cache.decode(&mut op);
        let Stage::Decode(d) = op.stage else {
            panic!("expected decode stage");
        };
        assert_eq!(d.dispatch, Dispatch::Add);
        // The original line still decodes correctly after eviction.
        let mut op = fetched(0x0, 0xFFD1_0093);
        cache.decode(&mut op);
        let Stage::Decode(d) = op.stage else {
            panic!("expected decode stage");
        };
        assert_eq!(d.dispatch, Dispatch::Addi);
    }

    #[test]
    fn test_clear() {
        let mut cache = DecodeCache::new(2, 2);
        let mut op = fetched(0x0, 0xFFD1_0093);
        cache.decode(&mut op);
        cache.clear();
        assert!(cache.lines.iter().all(|l| *l == (0, Decoded::INVALID)));
    }
}
