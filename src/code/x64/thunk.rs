//! # Closure thunks
//!
//! A closure thunk loads a bound data word into one argument register and tail-jumps to the
//! bound function. Both words live just below the thunk:
//!
//! ```text
//! thunk - 16: data word      <- mov <reg>, [rip - 0x17]
//! thunk -  8: function word  <- jmp [rip - 0x15]
//! thunk +  0: template bytes
//! ```

/// Argument registers of the System V x86-64 calling convention, in order
pub const ARGUMENT_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Largest arity a closure can bind its data to; the data always goes in the last argument
pub const MAX_BOUND_ARITY: usize = ARGUMENT_REGISTERS.len();

/// Length of every thunk template
pub const THUNK_LEN: usize = 13;

/// Offset of the bound data word relative to the thunk
pub const DATA_WORD_OFFSET: isize = -16;

/// Offset of the bound function word relative to the thunk
pub const FUNCTION_WORD_OFFSET: isize = -8;

/// Machine code of a thunk for one arity
#[derive(Debug)]
pub struct ThunkTemplate {
    /// Register that receives the bound data
    pub register: &'static str,
    /// Template bytes; displacements are already fixed up for [`DATA_WORD_OFFSET`] and [`FUNCTION_WORD_OFFSET`]
    pub code: [u8; THUNK_LEN],
}

/// Builds a template: `mov <reg>, [rip - 0x17]` (7 bytes) then `jmp [rip - 0x15]` (6 bytes)
const fn template(register: &'static str, rex: u8, modrm: u8) -> ThunkTemplate {
    ThunkTemplate {
        register,
        code: [
            rex, 0x8b, modrm, 0xe9, 0xff, 0xff, 0xff, // mov <reg>, [rip - 0x17]
            0xff, 0x25, 0xeb, 0xff, 0xff, 0xff, // jmp [rip - 0x15]
        ],
    }
}

/// Thunk templates indexed by `arity - 1`
pub static THUNKS: [ThunkTemplate; MAX_BOUND_ARITY] = [
    template(ARGUMENT_REGISTERS[0], 0x48, 0x3d),
    template(ARGUMENT_REGISTERS[1], 0x48, 0x35),
    template(ARGUMENT_REGISTERS[2], 0x48, 0x15),
    template(ARGUMENT_REGISTERS[3], 0x48, 0x0d),
    template(ARGUMENT_REGISTERS[4], 0x4c, 0x05),
    template(ARGUMENT_REGISTERS[5], 0x4c, 0x0d),
];

/// Returns the template binding data to the last argument of a function taking `nargs` arguments
pub fn thunk_for(nargs: usize) -> Option<&'static ThunkTemplate> {
    nargs.checked_sub(1).and_then(|index| THUNKS.get(index))
}
