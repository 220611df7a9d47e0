//! # Hook
//!
//! This module covers hooks, which redirect execution from one function to another

use std::ptr;

use crate::function::SysvFn;

pub mod inspect;
pub mod slot;

pub use self::slot::{HotpatchError, SlotHook};

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; implementors must leave `source` callable at every point of the hook
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;

    /// Creates a hook which redirects `source` to `destination`.
    ///
    /// A null `destination` removes the hook.
    ///
    /// # Safety
    ///
    /// - `source` must be a valid pointer
    /// - `destination` must be null or valid executable code with the same signature as `source`
    unsafe fn hook(&self, source: *const u8, destination: *const u8) -> Result<(), Self::Error>;

    /// Removes any hook from `source`, restoring its original behavior
    ///
    /// # Safety
    ///
    /// `source` must be a valid pointer
    unsafe fn unhook(&self, source: *const u8) -> Result<(), Self::Error> {
        self.hook(source, ptr::null())
    }
}

/// Engine behind [`hotpatch`] and [`unhotpatch`]
static HOTPATCH: SlotHook = SlotHook::new();

/// Engine behind the typed wrappers, which never patch functions without a patch slot
static TYPED_HOTPATCH: SlotHook = SlotHook::new().verify_marker(true);

/// Replaces the body of the patchable function `target` with `replacement`.
///
/// Passing a null `replacement`, or `target` itself, restores the original body.
///
/// The slot holds a `jmp rel32`, so `replacement` must lie within ±2 GiB of `target`; anything
/// further away fails with [`HotpatchError::OutOfRange`]. Closure thunks live in their own
/// mappings, usually far from the executable's code, so patching straight to a closure
/// generally fails this way.
///
/// # Safety
///
/// - `target` must be null or point to readable memory at least 8 bytes long
/// - `replacement` must be null or a function with the same signature and calling convention as `target`
pub unsafe fn hotpatch(target: *const u8, replacement: *const u8) -> Result<(), HotpatchError> {
    HOTPATCH.hook(target, replacement)
}

/// Restores the original body of the patchable function `target`.
///
/// # Safety
///
/// See [`hotpatch`]
pub unsafe fn unhotpatch(target: *const u8) -> Result<(), HotpatchError> {
    HOTPATCH.unhook(target)
}

/// Replaces the body of the patchable function `target` with `replacement`, or restores it on `None`.
///
/// Both functions share one signature, so a mismatched replacement doesn't compile. Unlike
/// [`hotpatch`] the patch slot is always checked, even with the `unsafe-hotpatch` feature.
/// See [`hotpatch`] for the reach of the jump.
pub fn hotpatch_fn<F: SysvFn>(target: F, replacement: Option<F>) -> Result<(), HotpatchError> {
    let replacement = replacement.map_or(ptr::null(), SysvFn::address);
    // Safety: function pointers are readable code, and the replacement has the target's signature
    unsafe { TYPED_HOTPATCH.hook(target.address(), replacement) }
}

/// Restores the original body of the patchable function `target`
pub fn unhotpatch_fn<F: SysvFn>(target: F) -> Result<(), HotpatchError> {
    hotpatch_fn(target, None)
}
