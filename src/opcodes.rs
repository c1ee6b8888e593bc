// ABOUTME: The target VM's 32-bit instruction set: numbering, operand layouts,
// encoding helpers, and single-instruction disassembly

/// Operand layout of an instruction word. Slots and immediates share the
/// three bytes above the opcode: {op:8, A:8, B:8, C:8}, {op:8, A:8, imm:16},
/// or {op:8, imm:24}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operands.
    None,
    /// One slot, up to 24 bits wide.
    S,
    /// Signed 24-bit jump offset in instruction units.
    L,
    /// Slot A, slot B (B up to 16 bits).
    SS,
    /// Slot A, signed 16-bit jump offset.
    SL,
    /// Slot A, signed 16-bit immediate.
    SI,
    /// Slot A, unsigned 16-bit immediate.
    SU,
    /// Slots A and B, unsigned 8-bit immediate C.
    SSU,
    /// Slots A and B, signed 8-bit immediate C.
    SSI,
    /// Three 8-bit slots.
    SSS,
    /// Slot A, environment index B, environment slot C.
    SES,
    /// Slot A, 16-bit constant-pool index.
    SC,
    /// Slot A, 16-bit sub-definition index.
    SD,
}

macro_rules! opcodes {
    ($( $variant:ident = $value:literal, $name:literal, $kind:ident; )*) => {
        /// The instruction set, numbered exactly as the VM decodes it.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $( $variant = $value, )*
        }

        impl Opcode {
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $value => Some(Opcode::$variant), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            pub fn operands(self) -> OperandKind {
                match self {
                    $( Opcode::$variant => OperandKind::$kind, )*
                }
            }
        }
    };
}

opcodes! {
    Noop = 0, "noop", None;
    Error = 1, "error", S;
    Typecheck = 2, "typecheck", SU;
    Return = 3, "return", S;
    ReturnNil = 4, "return-nil", None;
    AddInteger = 5, "add-integer", SSS;
    AddImmediate = 6, "add-immediate", SSI;
    AddReal = 7, "add-real", SSS;
    Add = 8, "add", SSS;
    SubtractInteger = 9, "subtract-integer", SSS;
    SubtractReal = 10, "subtract-real", SSS;
    Subtract = 11, "subtract", SSS;
    MultiplyInteger = 12, "multiply-integer", SSS;
    MultiplyImmediate = 13, "multiply-immediate", SSI;
    MultiplyReal = 14, "multiply-real", SSS;
    Multiply = 15, "multiply", SSS;
    DivideInteger = 16, "divide-integer", SSS;
    DivideImmediate = 17, "divide-immediate", SSI;
    DivideReal = 18, "divide-real", SSS;
    Divide = 19, "divide", SSS;
    Band = 20, "band", SSS;
    Bor = 21, "bor", SSS;
    Bxor = 22, "bxor", SSS;
    Bnot = 23, "bnot", SS;
    ShiftLeft = 24, "shift-left", SSS;
    ShiftLeftImmediate = 25, "shift-left-immediate", SSI;
    ShiftRight = 26, "shift-right", SSS;
    ShiftRightImmediate = 27, "shift-right-immediate", SSI;
    ShiftRightUnsigned = 28, "shift-right-unsigned", SSS;
    ShiftRightUnsignedImmediate = 29, "shift-right-unsigned-immediate", SSI;
    MoveFar = 30, "move-far", SS;
    MoveNear = 31, "move-near", SS;
    Jump = 32, "jump", L;
    JumpIf = 33, "jump-if", SL;
    JumpIfNot = 34, "jump-if-not", SL;
    GreaterThan = 35, "greater-than", SSS;
    GreaterThanInteger = 36, "greater-than-integer", SSS;
    GreaterThanImmediate = 37, "greater-than-immediate", SSI;
    GreaterThanReal = 38, "greater-than-real", SSS;
    GreaterThanEqualReal = 39, "greater-than-equal-real", SSS;
    LessThan = 40, "less-than", SSS;
    LessThanInteger = 41, "less-than-integer", SSS;
    LessThanImmediate = 42, "less-than-immediate", SSI;
    LessThanReal = 43, "less-than-real", SSS;
    LessThanEqualReal = 44, "less-than-equal-real", SSS;
    Equals = 45, "equals", SSS;
    EqualsInteger = 46, "equals-integer", SSS;
    EqualsImmediate = 47, "equals-immediate", SSI;
    EqualsReal = 48, "equals-real", SSS;
    Compare = 49, "compare", SSS;
    LoadNil = 50, "load-nil", S;
    LoadTrue = 51, "load-true", S;
    LoadFalse = 52, "load-false", S;
    LoadInteger = 53, "load-integer", SI;
    LoadConstant = 54, "load-constant", SC;
    LoadUpvalue = 55, "load-upvalue", SES;
    LoadSelf = 56, "load-self", S;
    SetUpvalue = 57, "set-upvalue", SES;
    Closure = 58, "closure", SD;
    Push = 59, "push", S;
    Push2 = 60, "push-2", SS;
    Push3 = 61, "push-3", SSS;
    PushArray = 62, "push-array", S;
    Call = 63, "call", SS;
    Tailcall = 64, "tailcall", S;
    Resume = 65, "resume", SSS;
    Signal = 66, "signal", SSS;
    Get = 67, "get", SSS;
    Put = 68, "put", SSS;
    GetIndex = 69, "get-index", SSU;
    PutIndex = 70, "put-index", SSU;
    Length = 71, "length", SS;
    MakeArray = 72, "make-array", S;
    MakeBuffer = 73, "make-buffer", S;
    MakeString = 74, "make-string", S;
    MakeStruct = 75, "make-struct", S;
    MakeTable = 76, "make-table", S;
    MakeTuple = 77, "make-tuple", S;
    NumericLessThan = 78, "numeric-less-than", SSS;
    NumericLessThanEqual = 79, "numeric-less-than-equal", SSS;
    NumericGreaterThan = 80, "numeric-greater-than", SSS;
    NumericGreaterThanEqual = 81, "numeric-greater-than-equal", SSS;
    NumericEqual = 82, "numeric-equal", SSS;
}

// Encoding helpers. Operands are masked, never range-checked here; the
// emit layer is responsible for staying inside each field's width.

pub fn encode(op: Opcode) -> u32 {
    op as u32
}

pub fn encode_s(op: Opcode, a: u32) -> u32 {
    op as u32 | (a << 8)
}

pub fn encode_ss(op: Opcode, a: u32, b: u32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | (b << 16)
}

pub fn encode_sss(op: Opcode, a: u32, b: u32, c: u32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((b & 0xFF) << 16) | ((c & 0xFF) << 24)
}

pub fn encode_si(op: Opcode, a: u32, imm: i32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((imm as u32 & 0xFFFF) << 16)
}

pub fn encode_su(op: Opcode, a: u32, imm: u32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((imm & 0xFFFF) << 16)
}

pub fn encode_l(op: Opcode, offset: i32) -> u32 {
    op as u32 | ((offset as u32 & 0xFF_FFFF) << 8)
}

pub fn encode_sl(op: Opcode, a: u32, offset: i32) -> u32 {
    op as u32 | ((a & 0xFF) << 8) | ((offset as u32 & 0xFFFF) << 16)
}

pub fn opcode_of(word: u32) -> Option<Opcode> {
    Opcode::from_u8((word & 0xFF) as u8)
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Render one instruction word as text, e.g. `push-2 0 1` or `jump -3`.
pub fn disassemble_instruction(word: u32) -> String {
    let Some(op) = opcode_of(word) else {
        return format!("unknown 0x{:08x}", word);
    };
    let a = (word >> 8) & 0xFF;
    let b = (word >> 16) & 0xFF;
    let c = (word >> 24) & 0xFF;
    let wide = (word >> 16) & 0xFFFF;
    match op.operands() {
        OperandKind::None => op.name().to_string(),
        OperandKind::S => format!("{} {}", op.name(), (word >> 8) & 0xFF_FFFF),
        OperandKind::L => format!("{} {}", op.name(), sign_extend((word >> 8) & 0xFF_FFFF, 24)),
        OperandKind::SS => format!("{} {} {}", op.name(), a, wide),
        OperandKind::SL => format!("{} {} {}", op.name(), a, sign_extend(wide, 16)),
        OperandKind::SI => format!("{} {} {}", op.name(), a, sign_extend(wide, 16)),
        OperandKind::SU | OperandKind::SC | OperandKind::SD => {
            format!("{} {} {}", op.name(), a, wide)
        }
        OperandKind::SSU => format!("{} {} {} {}", op.name(), a, b, c),
        OperandKind::SSI => format!("{} {} {} {}", op.name(), a, b, sign_extend(c, 8)),
        OperandKind::SSS | OperandKind::SES => format!("{} {} {} {}", op.name(), a, b, c),
    }
}
