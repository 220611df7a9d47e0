//! # Patcher
//!
//! This module covers patchers, which write a new value into the patch slot of a function

use crate::code::x64::Slot;

pub mod mem;
pub mod slot;

/// Patchers overwrite the 8-byte slot at a location
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`Infallible`](core::convert::Infallible).
    type Error;

    /// Writes `slot` to `target`.
    ///
    /// # Safety
    ///
    /// `target` must be valid for an 8-byte write and aligned to [`SLOT_ALIGN`](crate::code::x64::SLOT_ALIGN),
    /// along with any extra requirements of the implementor
    unsafe fn patch(&self, target: *mut u8, slot: Slot) -> Result<(), Self::Error>;
}
