//! # Slot Hook
//!
//! This hook redirects a patchable function by writing a `jmp rel32` into its entry slot

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use log::{debug, trace};
use thiserror::Error;

use crate::code::x64::{self, DisplacementError, SlotState, SLOT_ALIGN, SLOT_MARKER};
use crate::patcher::mem::{PageGateway, PermissionError, PermissionWrapper, RegionGateway};
use crate::patcher::slot::{self as slot_io, SlotWriter};
use crate::patcher::Patcher;

use super::Hook;

lazy_static! {
    /// Serializes every slot write in the process, whichever [`SlotHook`] performs it
    static ref PATCH_LOCK: Mutex<()> = Mutex::new(());
}

/// Errors when hotpatching a function
#[derive(Debug, Error)]
pub enum HotpatchError {
    /// The target pointer was null
    #[error("target function pointer is null")]
    NullTarget,
    /// The target doesn't start with a patch slot
    #[error("function at {0:#x} does not start with a patch slot")]
    Unmarked(usize),
    /// The target isn't aligned well enough for a single-store write
    #[error("function at {0:#x} is not aligned to {SLOT_ALIGN} bytes")]
    Misaligned(usize),
    /// The replacement can't be reached with a rel32 jump
    #[error(transparent)]
    OutOfRange(#[from] DisplacementError),
    /// Changing the page permissions failed
    #[error(transparent)]
    Permission(#[from] PermissionError<Infallible>),
}

/// Hotpatch engine
///
/// Checks the target, then writes either [`SLOT_MARKER`] or a jump to the replacement into its slot,
/// making the page writable for the duration of the write.
pub struct SlotHook<G: PageGateway = RegionGateway> {
    /// Writes the slot inside unlock/relock
    patcher: PermissionWrapper<SlotWriter, G>,
    /// Refuse targets whose slot is neither the marker nor a jump
    verify_marker: bool,
}

impl SlotHook {
    /// Creates the default engine.
    ///
    /// Only functions with a patch slot are accepted, unless the `unsafe-hotpatch` feature is enabled.
    pub const fn new() -> Self {
        Self::with_gateway(RegionGateway)
    }

    /// Creates an engine that patches any aligned function, slot or not
    ///
    /// Patching a function without a patch slot overwrites the first 8 bytes of its code
    pub const fn unchecked() -> Self {
        Self::with_gateway(RegionGateway).verify_marker(false)
    }
}

impl Default for SlotHook {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: PageGateway> SlotHook<G> {
    /// Creates an engine that changes page permissions through `gateway`
    pub const fn with_gateway(gateway: G) -> Self {
        Self {
            patcher: PermissionWrapper::new(SlotWriter::new(), gateway),
            verify_marker: !cfg!(feature = "unsafe-hotpatch"),
        }
    }

    /// Sets whether targets must start with a patch slot
    pub const fn verify_marker(mut self, verify: bool) -> Self {
        self.verify_marker = verify;
        self
    }

    /// Checks `target` can be patched, in the order null, slot, alignment
    ///
    /// # Safety
    ///
    /// `target` must be null or valid for an 8-byte read
    unsafe fn validate(&self, target: *const u8) -> Result<(), HotpatchError> {
        if target.is_null() {
            return Err(HotpatchError::NullTarget);
        }

        if self.verify_marker {
            let state = x64::decode(&slot_io::load(target));
            trace!("slot of {:#x} is {state:?}", target as usize);
            if !state.is_patchable() {
                return Err(HotpatchError::Unmarked(target as usize));
            }
        }

        if target as usize % SLOT_ALIGN != 0 {
            return Err(HotpatchError::Misaligned(target as usize));
        }

        Ok(())
    }
}

unsafe impl<G: PageGateway> Hook for SlotHook<G> {
    type Error = HotpatchError;

    unsafe fn hook(&self, source: *const u8, destination: *const u8) -> Result<(), Self::Error> {
        let _guard = PATCH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        self.validate(source)?;

        // Jumping to ourselves would loop forever, and there's nothing to jump to at null
        let slot = if destination.is_null() || destination == source {
            debug!("restoring {:#x}", source as usize);
            SLOT_MARKER
        } else {
            debug!(
                "patching {:#x} -> {:#x}",
                source as usize, destination as usize
            );
            x64::encode_jump(source as usize, destination as usize)?
        };

        self.patcher.patch(source as *mut u8, slot)?;
        Ok(())
    }
}

/// Decodes the current slot of `target`
///
/// # Safety
///
/// `target` must be valid for an 8-byte read
pub(crate) unsafe fn slot_state(target: *const u8) -> SlotState {
    x64::decode(&slot_io::load(target))
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use crate::code::x64::{self, SlotState, SLOT_MARKER, SLOT_SIZE};
    use crate::hook::slot::{HotpatchError, SlotHook};
    use crate::hook::Hook;
    use crate::patcher::mem::{PageGateway, PermissionError};

    /// Stand-in for a patchable function, with room to misalign it
    #[repr(C, align(16))]
    struct Entry([u8; 2 * SLOT_SIZE]);
    impl Entry {
        /// An unpatched entry
        fn marked() -> Self {
            let mut bytes = [0x90; 2 * SLOT_SIZE];
            bytes[..SLOT_SIZE].copy_from_slice(&SLOT_MARKER);
            Self(bytes)
        }

        /// Decoded slot
        fn state(&self) -> SlotState {
            x64::decode(self.0[..SLOT_SIZE].try_into().unwrap())
        }
    }

    /// Gateway that never touches page permissions, for entries living in ordinary memory
    struct NoopGateway {
        /// Fail `make_executable_only`
        fail_relock: bool,
    }
    unsafe impl PageGateway for NoopGateway {
        unsafe fn make_writable_executable(&self, _address: *const u8) -> region::Result<()> {
            Ok(())
        }

        unsafe fn make_executable_only(&self, _address: *const u8) -> region::Result<()> {
            if self.fail_relock {
                return Err(region::Error::InvalidParameter("relock"));
            }
            Ok(())
        }
    }

    /// Engine over ordinary memory
    fn engine() -> SlotHook<NoopGateway> {
        SlotHook::with_gateway(NoopGateway { fail_relock: false }).verify_marker(true)
    }

    #[test]
    /// Patch, repatch and restore an entry
    fn test_patch_cycle() {
        let mut entry = Entry::marked();
        let source = entry.0.as_mut_ptr() as *const u8;
        let first = source.wrapping_add(0x1000);
        let second = source.wrapping_sub(0x2000);
        let hook = engine();

        unsafe { hook.hook(source, first).unwrap() };
        assert_eq!(
            entry.state().destination(source as usize),
            Some(first as usize)
        );

        // an already patched slot can be patched again
        unsafe { hook.hook(source, second).unwrap() };
        assert_eq!(
            entry.state().destination(source as usize),
            Some(second as usize)
        );

        unsafe { hook.unhook(source).unwrap() };
        assert_eq!(entry.state(), SlotState::Unpatched);
        // the body is never touched
        assert_eq!(entry.0[SLOT_SIZE..], [0x90; SLOT_SIZE]);
    }

    #[test]
    /// Patching a function to itself restores it instead of looping
    fn test_self_patch_restores() {
        let mut entry = Entry::marked();
        let source = entry.0.as_mut_ptr() as *const u8;
        let hook = engine();

        unsafe { hook.hook(source, source.wrapping_add(0x40)).unwrap() };
        unsafe { hook.hook(source, source).unwrap() };
        assert_eq!(entry.state(), SlotState::Unpatched);
    }

    #[test]
    /// Every rejected target is left exactly as it was
    fn test_rejections() {
        let hook = engine();

        assert!(matches!(
            unsafe { hook.hook(ptr::null(), ptr::null()) },
            Err(HotpatchError::NullTarget)
        ));

        // push rbp; mov rbp, rsp; ...
        let mut foreign = Entry([
            0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        let original = foreign.0;
        let source = foreign.0.as_mut_ptr() as *const u8;
        assert!(matches!(
            unsafe { hook.hook(source, source.wrapping_add(0x40)) },
            Err(HotpatchError::Unmarked(_))
        ));
        assert_eq!(foreign.0, original);

        // a marker that isn't 8-aligned
        let mut misaligned = Entry([0x90; 2 * SLOT_SIZE]);
        misaligned.0[4..4 + SLOT_SIZE].copy_from_slice(&SLOT_MARKER);
        let original = misaligned.0;
        let source = unsafe { misaligned.0.as_mut_ptr().add(4) } as *const u8;
        assert!(matches!(
            unsafe { hook.hook(source, source.wrapping_add(0x40)) },
            Err(HotpatchError::Misaligned(_))
        ));
        assert_eq!(misaligned.0, original);

        // too far away for a rel32 jump
        let mut entry = Entry::marked();
        let source = entry.0.as_mut_ptr() as *const u8;
        let far = (source as usize).wrapping_add(1 << 40) as *const u8;
        assert!(matches!(
            unsafe { hook.hook(source, far) },
            Err(HotpatchError::OutOfRange(_))
        ));
        assert_eq!(entry.state(), SlotState::Unpatched);
    }

    #[test]
    /// Marker verification can be switched off
    fn test_unchecked() {
        let mut foreign = Entry([0x55; 2 * SLOT_SIZE]);
        let source = foreign.0.as_mut_ptr() as *const u8;
        let target = source.wrapping_add(0x80);
        let hook = SlotHook::with_gateway(NoopGateway { fail_relock: false });
        let hook = hook.verify_marker(false);

        unsafe { hook.hook(source, target).unwrap() };
        assert_eq!(
            foreign.state().destination(source as usize),
            Some(target as usize)
        );

        // alignment still applies
        let misaligned = unsafe { foreign.0.as_mut_ptr().add(1) } as *const u8;
        assert!(matches!(
            unsafe { hook.hook(misaligned, target) },
            Err(HotpatchError::Misaligned(_))
        ));
    }

    #[test]
    /// A relock failure is reported after the jump was already written
    fn test_relock_failure() {
        let mut entry = Entry::marked();
        let source = entry.0.as_mut_ptr() as *const u8;
        let target = source.wrapping_add(0x100);
        let hook = SlotHook::with_gateway(NoopGateway { fail_relock: true });

        let result = unsafe { hook.hook(source, target) };

        assert!(matches!(
            result,
            Err(HotpatchError::Permission(PermissionError::Relock { .. }))
        ));
        assert_eq!(
            entry.state().destination(source as usize),
            Some(target as usize)
        );
    }
}
