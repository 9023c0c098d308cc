/// Encoded opcodes of the code heap.
///
/// Every instruction starts with a 16-bit opcode followed by fixed-size
/// operands:
///
/// - `Push`: value literal (tag u64, payload u64)
/// - `Dup`, `GetLocal`, `SetLocal`: u16 index
/// - `HasTag`: u8 tag
/// - `Jump`: u32 branch slot
/// - `IfTrue`: u32 then-slot, u32 else-slot
/// - `Call`: u16 argument count, u32 call-site cache, u32 return slot, u32 source position
/// - `Abort`: u32 source position
///
/// All other opcodes have no operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    GetLocal,
    SetLocal,

    // Stack manipulation
    Push,
    Pop,
    Dup,
    Swap,

    // 64-bit integer operations
    AddI64,
    SubI64,
    MulI64,
    LtI64,
    LeI64,
    GtI64,
    GeI64,
    EqI64,

    // String operations
    StrLen,
    GetChar,
    GetCharCode,
    StrCat,
    EqStr,

    // Object operations
    NewObject,
    HasField,
    SetField,
    GetField,
    EqObj,

    // Miscellaneous
    EqBool,
    HasTag,

    // Array operations
    NewArray,
    ArrayLen,
    ArrayPush,
    GetElem,
    SetElem,

    // Branches
    Jump,
    IfTrue,
    Call,
    Ret,

    Import,
    Abort,
}

/// Marker for "no source position" in `Call`/`Abort` operands.
pub const NO_SRC_POS: u32 = u32::MAX;

const ALL: [Opcode; COUNT as usize] = [
    Opcode::GetLocal,
    Opcode::SetLocal,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Dup,
    Opcode::Swap,
    Opcode::AddI64,
    Opcode::SubI64,
    Opcode::MulI64,
    Opcode::LtI64,
    Opcode::LeI64,
    Opcode::GtI64,
    Opcode::GeI64,
    Opcode::EqI64,
    Opcode::StrLen,
    Opcode::GetChar,
    Opcode::GetCharCode,
    Opcode::StrCat,
    Opcode::EqStr,
    Opcode::NewObject,
    Opcode::HasField,
    Opcode::SetField,
    Opcode::GetField,
    Opcode::EqObj,
    Opcode::EqBool,
    Opcode::HasTag,
    Opcode::NewArray,
    Opcode::ArrayLen,
    Opcode::ArrayPush,
    Opcode::GetElem,
    Opcode::SetElem,
    Opcode::Jump,
    Opcode::IfTrue,
    Opcode::Call,
    Opcode::Ret,
    Opcode::Import,
    Opcode::Abort,
];

const COUNT: u16 = Opcode::Abort as u16 + 1;

impl Opcode {
    pub fn from_u16(raw: u16) -> Option<Opcode> {
        if raw < COUNT {
            Some(ALL[raw as usize])
        } else {
            None
        }
    }

    /// Instruction name as written in a block's `op` field.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::GetLocal => "get_local",
            Opcode::SetLocal => "set_local",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::AddI64 => "add_i64",
            Opcode::SubI64 => "sub_i64",
            Opcode::MulI64 => "mul_i64",
            Opcode::LtI64 => "lt_i64",
            Opcode::LeI64 => "le_i64",
            Opcode::GtI64 => "gt_i64",
            Opcode::GeI64 => "ge_i64",
            Opcode::EqI64 => "eq_i64",
            Opcode::StrLen => "str_len",
            Opcode::GetChar => "get_char",
            Opcode::GetCharCode => "get_char_code",
            Opcode::StrCat => "str_cat",
            Opcode::EqStr => "eq_str",
            Opcode::NewObject => "new_object",
            Opcode::HasField => "has_field",
            Opcode::SetField => "set_field",
            Opcode::GetField => "get_field",
            Opcode::EqObj => "eq_obj",
            Opcode::EqBool => "eq_bool",
            Opcode::HasTag => "has_tag",
            Opcode::NewArray => "new_array",
            Opcode::ArrayLen => "array_len",
            Opcode::ArrayPush => "array_push",
            Opcode::GetElem => "get_elem",
            Opcode::SetElem => "set_elem",
            Opcode::Jump => "jump",
            Opcode::IfTrue => "if_true",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Import => "import",
            Opcode::Abort => "abort",
        }
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        ALL
            .iter()
            .copied()
            .find(|op| op.name() == name)
    }

    /// Instructions that end a block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::IfTrue | Opcode::Call | Opcode::Ret | Opcode::Abort
        )
    }
}
