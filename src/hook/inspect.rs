//! # Inspect
//!
//! Read-only queries on patch slots. None of these take the patch lock; a query racing with
//! [`hotpatch`](super::hotpatch) sees the slot either before or after the write.

use crate::code::x64::{Slot, SLOT_ALIGN, SLOT_SIZE};
use crate::function::SysvFn;
use crate::patcher::slot as slot_io;

use super::slot::slot_state;

/// Returns the raw slot bytes at the entry of `function`
///
/// # Safety
///
/// `function` must be valid for an 8-byte read
pub unsafe fn read_slot(function: *const u8) -> Slot {
    slot_io::load(function)
}

/// Returns true if `function` is aligned and starts with a patch slot, patched or not
///
/// # Safety
///
/// `function` must be null or valid for an 8-byte read
pub unsafe fn is_patchable(function: *const u8) -> bool {
    !function.is_null()
        && function as usize % SLOT_ALIGN == 0
        && slot_state(function).is_patchable()
}

/// Returns the replacement `function` currently jumps to, or `None` if it isn't patched
///
/// # Safety
///
/// `function` must be null or valid for an 8-byte read
pub unsafe fn is_patched(function: *const u8) -> Option<*const u8> {
    if !is_patchable(function) {
        return None;
    }
    slot_state(function)
        .destination(function as usize)
        .map(|address| address as *const u8)
}

/// Returns a callable address of the original body of `function`, even while it's patched.
///
/// Functions without a patch slot are returned unchanged.
///
/// # Safety
///
/// `function` must be null or valid for an 8-byte read
pub unsafe fn original_function(function: *const u8) -> *const u8 {
    if is_patchable(function) {
        function.add(SLOT_SIZE)
    } else {
        function
    }
}

/// Typed [`is_patched`]: the replacement `f` currently jumps to, or `None` if it isn't patched
pub fn patched<F: SysvFn>(f: F) -> Option<F> {
    // Safety: function pointers are readable code, and replacements share the target's signature
    unsafe { is_patched(f.address()).map(|address| F::from_address(address)) }
}

/// Typed [`original_function`]: the original body of `f`, callable even while it's patched
pub fn original<F: SysvFn>(f: F) -> F {
    // Safety: `f + 8` of a patchable function jumps into its body, which has the same signature
    unsafe { F::from_address(original_function(f.address())) }
}
