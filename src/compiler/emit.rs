// ABOUTME: Instruction emission: constant pool, slot materialization,
// copies with writeback, returns, and jump patching

use super::{Compiler, Slot, SLOT_CONSTANT, SLOT_REF, SLOT_RETURNED};
use crate::config::MAX_CONSTANTS;
use crate::opcodes::{
    encode, encode_l, encode_s, encode_si, encode_sl, encode_ss, encode_sss, encode_su, opcode_of,
    Opcode, OperandKind,
};
use crate::value::Value;

impl Compiler<'_> {
    /// Append one instruction with the current source mapping. Returns the
    /// instruction's index for later patching.
    pub(crate) fn emit(&mut self, word: u32) -> usize {
        self.buffer.push(word);
        self.mapbuffer.push(self.current_mapping);
        self.buffer.len() - 1
    }

    /// Pool a constant in the innermost function scope, deduplicated by
    /// structural equality.
    pub(crate) fn const_index(&mut self, value: &Value) -> u32 {
        let fi = self
            .scopes
            .iter()
            .rposition(|s| s.flags & super::SCOPE_FUNCTION != 0)
            .expect("a function scope always encloses compilation");
        let consts = &mut self.scopes[fi].consts;
        for (i, existing) in consts.iter().enumerate() {
            if existing.equals(value) {
                return i as u32;
            }
        }
        if consts.len() >= MAX_CONSTANTS {
            self.cerror("too many constants");
            return 0;
        }
        consts.push(value.clone());
        (consts.len() - 1) as u32
    }

    /// Load a constant value into a local register, using the dedicated
    /// opcodes for nil, booleans, and 16-bit integers.
    pub(crate) fn load_constant_into(&mut self, value: &Value, dest: i32) {
        let dest = dest as u32;
        match value {
            Value::Nil => {
                self.emit(encode_s(Opcode::LoadNil, dest));
            }
            Value::Boolean(true) => {
                self.emit(encode_s(Opcode::LoadTrue, dest));
            }
            Value::Boolean(false) => {
                self.emit(encode_s(Opcode::LoadFalse, dest));
            }
            Value::Integer(i) if *i >= i16::MIN as i32 && *i <= i16::MAX as i32 => {
                self.emit(encode_si(Opcode::LoadInteger, dest, *i));
            }
            other => {
                let index = self.const_index(other);
                self.emit(encode_su(Opcode::LoadConstant, dest, index));
            }
        }
    }

    /// Materialize any slot into a register usable as an operand no wider
    /// than `max`. `nth` picks the reserved temporary if the allocator
    /// cannot do better. Pair with `postread`.
    pub(crate) fn preread(&mut self, max: i32, nth: u8, slot: &Slot) -> i32 {
        let mut max = max;
        if slot.flags & SLOT_REF != 0 {
            max = 0xFF;
        }
        if slot.flags & (SLOT_CONSTANT | SLOT_REF) != 0 {
            let reg = self.allocator().alloc_near(0xFF, nth);
            self.load_constant_into(&slot.constant, reg);
            if slot.flags & SLOT_REF != 0 {
                // Global vars live in a one-element array; dereference it.
                self.emit(encode_sss(Opcode::GetIndex, reg as u32, reg as u32, 0));
            }
            reg
        } else if slot.envindex >= 0 {
            let reg = self.allocator().alloc_near(max, nth);
            self.emit(encode_sss(
                Opcode::LoadUpvalue,
                reg as u32,
                slot.envindex as u32,
                slot.index as u32,
            ));
            reg
        } else if slot.index > max {
            let reg = self.allocator().alloc_near(max, nth);
            self.emit(encode_ss(Opcode::MoveNear, reg as u32, slot.index as u32));
            reg
        } else {
            slot.index
        }
    }

    /// Release the register `preread` produced, if it was a temporary.
    pub(crate) fn postread(&mut self, slot: &Slot, reg: i32) {
        if reg != slot.index || slot.envindex >= 0 || slot.flags & SLOT_CONSTANT != 0 {
            self.allocator().free(reg);
        }
    }

    /// Move a value between slots. The destination must be writable; the
    /// branches handle upvalue writes, ref-cell writes, and far moves.
    pub(crate) fn copy(&mut self, dest: &Slot, src: &Slot) {
        if dest.flags & SLOT_CONSTANT != 0 {
            self.cerror("cannot write to constant");
            return;
        }
        if dest.sequal(src) {
            return;
        }

        // Near local destination: single instruction.
        if dest.envindex < 0 && dest.index >= 0 && dest.index <= 0xFF {
            if src.flags & SLOT_CONSTANT != 0 {
                self.load_constant_into(&src.constant, dest.index);
            } else if src.flags & SLOT_REF != 0 {
                self.load_constant_into(&src.constant, dest.index);
                self.emit(encode_sss(
                    Opcode::GetIndex,
                    dest.index as u32,
                    dest.index as u32,
                    0,
                ));
            } else if src.envindex >= 0 {
                self.emit(encode_sss(
                    Opcode::LoadUpvalue,
                    dest.index as u32,
                    src.envindex as u32,
                    src.index as u32,
                ));
            } else {
                self.emit(encode_ss(
                    Opcode::MoveNear,
                    dest.index as u32,
                    src.index as u32,
                ));
            }
            return;
        }

        // General path: src -> srclocal -> destlocal -> dest.
        let srclocal = self.preread(0xFF, 1, src);
        let mut reflocal = None;
        enum Writeback {
            Ref,
            Upvalue,
            Far,
            Direct,
        }
        let (writeback, destlocal) = if dest.flags & SLOT_REF != 0 {
            let reg = self.allocator().alloc_near(0xFF, 2);
            let index = self.const_index(&dest.constant);
            self.emit(encode_su(Opcode::LoadConstant, reg as u32, index));
            reflocal = Some(reg);
            (Writeback::Ref, srclocal)
        } else if dest.envindex >= 0 {
            (Writeback::Upvalue, srclocal)
        } else if dest.index > 0xFF {
            (Writeback::Far, srclocal)
        } else {
            (Writeback::Direct, dest.index)
        };

        if srclocal != destlocal {
            self.emit(encode_ss(
                Opcode::MoveNear,
                destlocal as u32,
                srclocal as u32,
            ));
        }

        match writeback {
            Writeback::Ref => {
                self.emit(encode_sss(
                    Opcode::PutIndex,
                    reflocal.expect("ref writeback allocated a register") as u32,
                    destlocal as u32,
                    0,
                ));
            }
            Writeback::Upvalue => {
                self.emit(encode_sss(
                    Opcode::SetUpvalue,
                    destlocal as u32,
                    dest.envindex as u32,
                    dest.index as u32,
                ));
            }
            Writeback::Far => {
                self.emit(encode_ss(
                    Opcode::MoveFar,
                    destlocal as u32,
                    dest.index as u32,
                ));
            }
            Writeback::Direct => {}
        }

        if let Some(reg) = reflocal {
            self.allocator().free(reg);
        }
        self.postread(src, srclocal);
    }

    /// Emit the return for a slot, once. Constant nil returns use the
    /// dedicated opcode.
    pub(crate) fn emit_return(&mut self, mut slot: Slot) -> Slot {
        if slot.flags & SLOT_RETURNED == 0 {
            if slot.flags & SLOT_CONSTANT != 0 && slot.constant.is_nil() {
                self.emit(encode(Opcode::ReturnNil));
            } else {
                let reg = self.preread(0xFFFF, 1, &slot);
                self.emit(encode_s(Opcode::Return, reg as u32));
                self.postread(&slot, reg);
            }
            slot.flags |= SLOT_RETURNED;
        }
        slot
    }

    /// Push argument slots for a call or constructor, three at a time.
    pub(crate) fn push_slots(&mut self, slots: &[Slot]) {
        let n = slots.len();
        let mut i = 0;
        while i + 3 <= n {
            let r1 = self.preread(0xFF, 1, &slots[i]);
            let r2 = self.preread(0xFF, 2, &slots[i + 1]);
            let r3 = self.preread(0xFF, 3, &slots[i + 2]);
            self.emit(encode_sss(Opcode::Push3, r1 as u32, r2 as u32, r3 as u32));
            self.postread(&slots[i], r1);
            self.postread(&slots[i + 1], r2);
            self.postread(&slots[i + 2], r3);
            i += 3;
        }
        if n - i == 2 {
            let r1 = self.preread(0xFF, 1, &slots[i]);
            let r2 = self.preread(0xFFFF, 2, &slots[i + 1]);
            self.emit(encode_ss(Opcode::Push2, r1 as u32, r2 as u32));
            self.postread(&slots[i], r1);
            self.postread(&slots[i + 1], r2);
        } else if n - i == 1 {
            let r1 = self.preread(0xFF_FFFF, 1, &slots[i]);
            self.emit(encode_s(Opcode::Push, r1 as u32));
            self.postread(&slots[i], r1);
        }
    }

    /// Push a mixed run of plain and spliced slots: spliced entries flatten
    /// through `push-array`, the rest batch as usual.
    pub(crate) fn push_parts(&mut self, parts: &[(Slot, bool)]) {
        let mut run: Vec<Slot> = Vec::new();
        for (slot, spliced) in parts {
            if *spliced {
                self.push_slots(&run);
                run.clear();
                let reg = self.preread(0xFF, 1, slot);
                self.emit(encode_s(Opcode::PushArray, reg as u32));
                self.postread(slot, reg);
            } else {
                run.push(slot.clone());
            }
        }
        self.push_slots(&run);
    }

    /// Emit a forward jump with a zero offset to be patched later.
    pub(crate) fn emit_forward_jump(&mut self, op: Opcode, cond_reg: Option<i32>) -> usize {
        match cond_reg {
            Some(reg) => self.emit(encode_sl(op, reg as u32, 0)),
            None => self.emit(encode_l(op, 0)),
        }
    }

    /// Point a previously emitted forward jump at the current end of the
    /// buffer. Offsets are in instruction units, relative to the jump.
    pub(crate) fn patch_jump(&mut self, at: usize) {
        let offset = (self.buffer.len() - at) as i32;
        let word = self.buffer[at];
        let op = opcode_of(word).expect("patching a word we emitted");
        self.buffer[at] = match op.operands() {
            OperandKind::L => encode_l(op, offset),
            OperandKind::SL => encode_sl(op, (word >> 8) & 0xFF, offset),
            other => unreachable!("patching non-jump operand kind {:?}", other),
        };
    }

    /// Emit an unconditional jump back to an existing label.
    pub(crate) fn emit_backward_jump(&mut self, target: usize) {
        let offset = target as i32 - self.buffer.len() as i32;
        self.emit(encode_l(Opcode::Jump, offset));
    }
}
