// Opcode bytes of the map-script bytecode. Every multi-byte operand is
// big-endian; widths are listed next to each opcode.

/* 00 TASK     */ pub(crate) const OP_TASK_CALL: u8 = 0x00; // u16 routine, [u8 count, params]
/* 01 ASYNC    */ pub(crate) const OP_ASYNC_CALL: u8 = 0x01; // u16 routine, [u8 count, params]
/* 02 CALL     */ pub(crate) const OP_FUNCTION_CALL: u8 = 0x02; // u16 routine, [u8 count, params]
/* 03 IF       */ pub(crate) const OP_IF: u8 = 0x03; // conditions, u32 block length, block
/* 04 GOTO     */ pub(crate) const OP_GOTO: u8 = 0x04; // u32 label
/* 05 END      */ pub(crate) const OP_END: u8 = 0x05; // u32 label
/* 06 FLAG     */ pub(crate) const OP_FLAG: u8 = 0x06; // u16 flag
/* 07 INT      */ pub(crate) const OP_LITERAL: u8 = 0x07; // i32
/* 08 FLEX     */ pub(crate) const OP_FLEXIBLE: u8 = 0x08; // i32
/* 09 VAR      */ pub(crate) const OP_VARIABLE: u8 = 0x09; // u8 slot
/* 0a STR      */ pub(crate) const OP_STRING: u8 = 0x0A; // u32 string index
/* 0b FIELD    */ pub(crate) const OP_OBJECT_FIELD: u8 = 0x0B; // object, u16 reference
/* 0c OBJCALL  */ pub(crate) const OP_OBJECT_CALL: u8 = 0x0C; // object, call
/* 0d RETURN   */ pub(crate) const OP_RETURN: u8 = 0x0D;
/* 0e ENDINT   */ pub(crate) const OP_ENDINT: u8 = 0x0E;
/* 0f GOSUB    */ pub(crate) const OP_GOSUB: u8 = 0x0F; // u32 label
/* 10 ANCHOR   */ pub(crate) const OP_ANCHOR: u8 = 0x10; // u8
/* 11 PAUSE    */ pub(crate) const OP_TASK_PAUSE: u8 = 0x11; // u32 label
/* 12 RESULT   */ pub(crate) const OP_RESULT_BRANCH: u8 = 0x12; // u8 value, u32 block length, block

// Object name selectors following OP_OBJECT_FIELD / OP_OBJECT_CALL.
pub(crate) const OBJECT_BUILTIN: u8 = 0x00; // u8 code, u8 ignored
pub(crate) const OBJECT_CUSTOM: u8 = 0x01; // u32 string index
pub(crate) const OBJECT_DYNAMIC: u8 = 0x02; // variable value

pub(crate) const BUILTIN_OBJECTS: [&str; 3] = ["self", "player", "camera"];

pub(crate) const CONJUNCTION_END: u8 = 0;
pub(crate) const CONJUNCTION_AND: u8 = 1;
pub(crate) const CONJUNCTION_OR: u8 = 2;

pub(crate) const COMPARATORS: [&str; 6] = ["=", "!=", "<", ">", "<=", ">="];

// Arithmetic operators live above every statement opcode so a formula can
// be continued by peeking a single byte.
pub(crate) const OPERATOR_BASE: u8 = 0x20;
pub(crate) const OPERATORS: [&str; 5] = ["+", "-", "*", "/", "%"];

/// Bracketed token naming the value returned by the last blocking call.
pub(crate) const SCRIPT_RV: &str = "ScriptRv";

/// Width of a reserved label slot. Only the low two bytes receive the
/// resolved address when the slot is backpatched.
pub(crate) const LABEL_SLOT_WIDTH: usize = 4;

/// Decoding/encoding context of a value. The same opcode continues
/// differently depending on where it appears.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueMode {
    /// Statement position: a flag, variable or field is an assignment target.
    Main,
    LeftOperand,
    RightOperand,
    /// Fixed-width call argument; flags and variables carry padding bytes.
    CallParameter,
    /// Dynamic object name; no continuation at all.
    Reference,
    Formula,
}

impl ValueMode {
    /// Whether arithmetic operators may follow a value in this mode.
    pub(crate) fn takes_operators(self) -> bool {
        matches!(
            self,
            ValueMode::LeftOperand | ValueMode::RightOperand | ValueMode::Formula
        )
    }
}

pub(crate) fn comparator_code(token: &str) -> Option<u8> {
    COMPARATORS.iter().position(|c| *c == token).map(|i| i as u8)
}

pub(crate) fn comparator_text(code: u8) -> Option<&'static str> {
    COMPARATORS.get(code as usize).copied()
}

pub(crate) fn operator_code(token: &str) -> Option<u8> {
    OPERATORS
        .iter()
        .position(|o| *o == token)
        .map(|i| OPERATOR_BASE + i as u8)
}

pub(crate) fn operator_text(byte: u8) -> Option<&'static str> {
    byte.checked_sub(OPERATOR_BASE)
        .and_then(|i| OPERATORS.get(i as usize).copied())
}

pub(crate) fn builtin_object_code(name: &str) -> Option<u8> {
    BUILTIN_OBJECTS.iter().position(|n| *n == name).map(|i| i as u8)
}

/// Parse `varN` into its slot number.
pub(crate) fn variable_slot(name: &str) -> Option<u8> {
    let digits = name.strip_prefix("var")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok()
}
