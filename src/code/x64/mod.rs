//! # x86-64 patch slot
//!
//! Every patchable function starts with an 8-byte slot. While unpatched the slot holds
//! [`SLOT_MARKER`], an 8-byte NOP that falls through into the function body. Patching
//! replaces it with a `jmp rel32` to the replacement followed by three padding bytes.

use thiserror::Error;

pub mod thunk;

/// Size of the patch slot at the entry of every patchable function
pub const SLOT_SIZE: usize = 8;

/// Minimum alignment of a patchable function, so the slot can be written with one aligned store
pub const SLOT_ALIGN: usize = 8;

/// Raw contents of a patch slot
pub type Slot = [u8; SLOT_SIZE];

/// Canonical "patchable, currently unpatched" marker (`nop dword ptr [rax + rax*1 + 0]`)
///
/// The [`patchable!`](crate::patchable) macro emits exactly these bytes, keep both in sync.
pub const SLOT_MARKER: Slot = [0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;

/// Length of a `jmp rel32` instruction; displacements are relative to its end
pub const JMP_REL32_LEN: usize = 5;

/// Filler for the slot bytes after the jump (`int3`)
pub const SLOT_PADDING: u8 = 0xcc;

/// Decoded state of a patch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot holds [`SLOT_MARKER`]
    Unpatched,
    /// Slot holds a `jmp rel32`
    Patched {
        /// Signed displacement from the end of the jump
        displacement: i32,
    },
    /// Slot holds anything else; the function was not built with a patch slot
    Foreign,
}

impl SlotState {
    /// Whether the slot belongs to a patchable function, patched or not
    pub fn is_patchable(&self) -> bool {
        !matches!(self, Self::Foreign)
    }

    /// Absolute address a patched slot at `target` jumps to
    pub fn destination(&self, target: usize) -> Option<usize> {
        match *self {
            Self::Patched { displacement } => Some(
                target
                    .wrapping_add(JMP_REL32_LEN)
                    .wrapping_add_signed(displacement as isize),
            ),
            _ => None,
        }
    }
}

/// The replacement is further away than a rel32 jump can reach
#[derive(Debug, Error)]
#[error("{replacement:#x} is out of rel32 range of {target:#x}")]
pub struct DisplacementError {
    /// Address of the slot being patched
    pub target: usize,
    /// Address that was supposed to be jumped to
    pub replacement: usize,
}

/// Decodes the raw bytes of a slot
pub fn decode(slot: &Slot) -> SlotState {
    if *slot == SLOT_MARKER {
        SlotState::Unpatched
    } else if slot[0] == JMP_REL32 {
        let mut rel = [0; 4];
        rel.copy_from_slice(&slot[1..JMP_REL32_LEN]);
        SlotState::Patched {
            displacement: i32::from_le_bytes(rel),
        }
    } else {
        SlotState::Foreign
    }
}

/// Encodes a slot at `target` that jumps to `replacement`
pub fn encode_jump(target: usize, replacement: usize) -> Result<Slot, DisplacementError> {
    let displacement = (replacement as i128) - (target as i128) - JMP_REL32_LEN as i128;
    let displacement = i32::try_from(displacement).map_err(|_| DisplacementError {
        target,
        replacement,
    })?;

    let mut slot = [SLOT_PADDING; SLOT_SIZE];
    slot[0] = JMP_REL32;
    slot[1..JMP_REL32_LEN].copy_from_slice(&displacement.to_le_bytes());
    Ok(slot)
}
