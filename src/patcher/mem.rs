//! This module contains a patcher which adjusts page permissions to patch code

use log::trace;
use region::Protection;
use thiserror::Error;

use crate::code::x64::{Slot, SLOT_SIZE};

use super::Patcher;

/// Changes the permissions of the page containing a patch slot or closure thunk
///
/// # Safety
///
/// Implementors change permissions of memory shared with every thread in the process.
/// A page left without execute permission will fault the next time anything runs on it.
pub unsafe trait PageGateway {
    /// Makes the page containing `address` writable while keeping it executable
    ///
    /// # Safety
    ///
    /// `address` must point into mapped memory
    unsafe fn make_writable_executable(&self, address: *const u8) -> region::Result<()>;

    /// Drops write access from the page containing `address`
    ///
    /// # Safety
    ///
    /// `address` must point into mapped memory
    unsafe fn make_executable_only(&self, address: *const u8) -> region::Result<()>;
}

/// [`PageGateway`] backed by `mprotect` through the `region` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionGateway;
unsafe impl PageGateway for RegionGateway {
    unsafe fn make_writable_executable(&self, address: *const u8) -> region::Result<()> {
        region::protect(address, SLOT_SIZE, Protection::READ_WRITE_EXECUTE)
    }

    unsafe fn make_executable_only(&self, address: *const u8) -> region::Result<()> {
        // Read access stays so the slot can still be inspected; x86 pages
        // made execute-only through protection keys would fault on it.
        region::protect(address, SLOT_SIZE, Protection::READ_EXECUTE)
    }
}

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// The page couldn't be made writable, nothing was written
    #[error("unable to make page {page:#x} writable")]
    Unlock {
        /// Start of the page
        page: usize,
        /// Underlying error from `mprotect`
        source: region::Error,
    },
    /// The slot was written but the page couldn't be write-protected again
    #[error("slot written but page {page:#x} could not be write-protected again")]
    Relock {
        /// Start of the page
        page: usize,
        /// Underlying error from `mprotect`
        source: region::Error,
    },
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    Inner(E),
}

/// This struct wraps patchers to allow them to write to code that's normally unwritable.
/// It achieves this result by making the page writable, triggering the patch, and then write-protecting the page again.
///
/// # Safety
///
/// `PermissionWrapper` only unlocks the page containing the start of the slot, pairing it with a patcher that writes
/// across a page boundary is undefined behavior. Aligned slots never cross one.
pub struct PermissionWrapper<P: Patcher, G: PageGateway = RegionGateway> {
    /// Underlying patcher.
    patcher: P,
    /// Gateway changing the permissions around the write
    gateway: G,
}
impl<P: Patcher, G: PageGateway> PermissionWrapper<P, G> {
    /// Creates a new PermissionWrapper
    pub const fn new(patcher: P, gateway: G) -> Self {
        Self { patcher, gateway }
    }
}

unsafe impl<P: Patcher, G: PageGateway> Patcher for PermissionWrapper<P, G> {
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, target: *mut u8, slot: Slot) -> Result<(), Self::Error> {
        let page = region::page::floor(target) as usize;

        trace!("unlocking page {page:#x}");
        if let Err(source) = self.gateway.make_writable_executable(target) {
            return Err(PermissionError::Unlock { page, source });
        }

        let written = self.patcher.patch(target, slot);

        // Relock even if the write failed, the page must not stay writable
        trace!("relocking page {page:#x}");
        if let Err(source) = self.gateway.make_executable_only(target) {
            return Err(PermissionError::Relock { page, source });
        }

        written.map_err(PermissionError::Inner)
    }
}
