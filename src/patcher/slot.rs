//! This module contains the slot writer, which stores a whole slot at once

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::code::x64::Slot;

use super::Patcher;

/// Patcher that writes the slot with a single aligned 8-byte store.
/// This patcher never fails.
///
/// Concurrent readers see either the old or the new slot, never a mix of both.
#[derive(Default)]
pub struct SlotWriter;
impl SlotWriter {
    /// Creates a new [`SlotWriter`]
    pub const fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for SlotWriter {
    type Error = Infallible;

    unsafe fn patch(&self, target: *mut u8, slot: Slot) -> Result<(), Self::Error> {
        // Safety: caller guarantees `target` is aligned and writable for the full slot
        let word = AtomicU64::from_ptr(target.cast());
        word.store(u64::from_le_bytes(slot), Ordering::SeqCst);
        Ok(())
    }
}

/// Reads a slot with a single 8-byte load, pairing with [`SlotWriter`].
///
/// Misaligned locations can't be written by [`SlotWriter`], they're read bytewise.
///
/// # Safety
///
/// `location` must be valid for an 8-byte read
pub unsafe fn load(location: *const u8) -> Slot {
    if location as usize % std::mem::align_of::<AtomicU64>() == 0 {
        AtomicU64::from_ptr(location as *mut u64)
            .load(Ordering::SeqCst)
            .to_le_bytes()
    } else {
        location.cast::<Slot>().read_unaligned()
    }
}
