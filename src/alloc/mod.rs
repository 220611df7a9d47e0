//! Allocates the two-page regions closure thunks live in
//!
//! Every region is its own anonymous mapping, never shared with another closure:
//!
//! ```text
//! base              : data page, read/write; its last 16 bytes hold the bound words
//! base + page_size  : thunk page, read/execute once the thunk is written
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::debug;
use thiserror::Error;

use crate::patcher::mem::{PageGateway, RegionGateway};

/// Errors while creating a thunk region
#[derive(Debug, Error)]
pub enum RegionError {
    /// Error while memmapping a region
    #[error("unable to map thunk region: {0}")]
    Map(mmap::MapError),
    /// Error while making the thunk page executable
    #[error("unable to make thunk page executable")]
    Protection(#[source] region::Error),
}

/// A two-page mapping holding one thunk.
///
/// Dropping the region unmaps both pages at once.
pub struct ThunkRegion {
    /// Live count of the arena the region belongs to
    live: &'static Mutex<usize>,
    /// Whole mapping. `Option` so that we can unmap it under the arena lock in our [`Drop::drop`] impl
    map: Option<mmap::MemoryMap>,
    /// Start of the mapping
    base: *mut u8,
    /// Size of one page
    page_size: usize,
}

impl ThunkRegion {
    /// Start of the thunk page
    pub fn thunk(&self) -> *mut u8 {
        self.base.wrapping_add(self.page_size)
    }

    /// Start of the whole mapping
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Length of the whole mapping
    pub fn len(&self) -> usize {
        2 * self.page_size
    }
}

/// Locks a live count, ignoring poisoning since the count can't be left half-updated
fn lock(live: &Mutex<usize>) -> MutexGuard<'_, usize> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe bookkeeping for thunk regions.
///
/// The lock serializes creation and release of regions; already created thunks are used without it.
/// Thunk pages are sealed through a [`PageGateway`], which only ever touches the single page
/// holding the thunk.
pub struct ThunkArena<G: PageGateway = RegionGateway> {
    /// Number of regions that haven't been released yet
    live: Mutex<usize>,
    /// Seals the thunk page
    gateway: G,
}

impl ThunkArena {
    /// Creates a new, empty arena
    pub const fn new() -> Self {
        Self::with_gateway(RegionGateway)
    }
}

impl Default for ThunkArena {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: PageGateway> ThunkArena<G> {
    /// Creates an empty arena that seals thunk pages through `gateway`
    pub const fn with_gateway(gateway: G) -> Self {
        Self {
            live: Mutex::new(0),
            gateway,
        }
    }

    /// Maps a fresh region, lets `fill` write the thunk and its words, then seals the thunk page.
    ///
    /// The region is unmapped again if anything fails.
    pub fn allocate<F>(&'static self, fill: F) -> Result<ThunkRegion, RegionError>
    where
        F: FnOnce(&ThunkRegion),
    {
        let mut live = lock(&self.live);
        let page_size = region::page::size();

        let map = mmap::MemoryMap::new(
            2 * page_size,
            &[mmap::MapOption::MapReadable, mmap::MapOption::MapWritable],
        )
        .map_err(RegionError::Map)?;
        let region = ThunkRegion {
            live: &self.live,
            base: map.data(),
            map: Some(map),
            page_size,
        };
        *live += 1;

        fill(&region);
        // Safety: the thunk page belongs to the mapping we just created
        let sealed = unsafe { self.gateway.make_executable_only(region.thunk()) };
        if let Err(e) = sealed {
            // dropping `region` unmaps it, which needs the lock back
            drop(live);
            drop(region);
            return Err(RegionError::Protection(e));
        }

        debug!(
            "mapped thunk region at {:#x} ({} live)",
            region.base() as usize,
            *live
        );
        Ok(region)
    }

    /// Number of regions that haven't been released yet
    pub fn live(&self) -> usize {
        *lock(&self.live)
    }
}

impl Drop for ThunkRegion {
    fn drop(&mut self) {
        let mut live = lock(self.live);
        let base = self.base as usize;
        // Release the whole mapping with a single munmap
        drop(self.map.take());
        *live = live.saturating_sub(1);
        debug!("unmapped thunk region at {base:#x} ({} live)", *live);
    }
}

lazy_static! {
    /// Arena every closure is allocated from
    static ref ARENA: ThunkArena = ThunkArena::new();
}

/// Allocates a thunk region from the process-wide arena
pub fn allocate_thunk<F>(fill: F) -> Result<ThunkRegion, RegionError>
where
    F: FnOnce(&ThunkRegion),
{
    ARENA.allocate(fill)
}

/// Number of thunk regions currently mapped
pub fn live_regions() -> usize {
    ARENA.live()
}

// Regions are only written before they are handed out
unsafe impl Send for ThunkRegion {}
unsafe impl Sync for ThunkRegion {}
