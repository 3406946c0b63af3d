//! Bump arenas with three engine lifetime scopes.
//!
//! The engine owns one [`Arena`] per scope (see [`EngineArenas`]): the app
//! arena lives for the whole process and backs the module state block, the
//! frame arena is reset at the top of every loop iteration, and the
//! swapchain arena is reset on every swapchain recreation.
//!
//! Allocation is chained fixed blocks with a bump cursor. An allocation
//! that would push the arena past its cap does not fail the caller: it
//! logs and hands back an empty slice, and callers for whom the allocation
//! is critical check the length themselves. Only the initial reserve can
//! fail, at construction time.

use std::cell::UnsafeCell;
use thiserror::Error;

/// Arena construction errors.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// The initial block reservation failed.
    #[error("arena reserve of {0} bytes failed")]
    ReserveFailed(usize),
}

const DEFAULT_ALIGN: usize = 16;

struct Block {
    data: Box<[u8]>,
    used: usize,
}

impl Block {
    fn try_new(size: usize) -> Result<Self, ArenaError> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| ArenaError::ReserveFailed(size))?;
        storage.resize(size, 0u8);
        Ok(Self {
            data: storage.into_boxed_slice(),
            used: 0,
        })
    }
}

/// A growable bump arena with a hard cap.
pub struct Arena {
    inner: UnsafeCell<Inner>,
    cap: usize,
}

struct Inner {
    blocks: Vec<Block>,
    block_size: usize,
    total: usize,
}

// The arena is used from lane 0 only; it is not Sync and does not need to be.
impl Arena {
    /// Reserve an arena with an initial block of `block_size` bytes and a
    /// total cap of `cap` bytes.
    pub fn with_capacity(block_size: usize, cap: usize) -> Result<Self, ArenaError> {
        let first = Block::try_new(block_size.min(cap))?;
        Ok(Self {
            inner: UnsafeCell::new(Inner {
                total: first.data.len(),
                blocks: vec![first],
                block_size,
            }),
            cap,
        })
    }

    /// Allocate `len` zeroed bytes aligned to 16.
    ///
    /// Returns an empty slice if the arena is exhausted; callers that
    /// cannot tolerate that must check `slice.len() == len`.
    pub fn alloc_bytes(&self, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        // Safety: allocations hand out disjoint sub-ranges of blocks whose
        // storage never moves (boxed slices), and reset requires &mut self,
        // so no allocation outlives the memory it points into.
        let inner = unsafe { &mut *self.inner.get() };

        if let Some(range) = inner.try_bump(len) {
            return unsafe { std::slice::from_raw_parts_mut(range, len) };
        }

        // Need a new block; respect the cap.
        let needed = len.max(inner.block_size);
        if inner.total + needed > self.cap {
            log::error!(
                "arena exhausted: {} bytes requested, {} of {} in use",
                len,
                inner.total,
                self.cap
            );
            return &mut [];
        }
        match Block::try_new(needed) {
            Ok(block) => {
                inner.total += block.data.len();
                inner.blocks.push(block);
                match inner.try_bump(len) {
                    Some(range) => unsafe { std::slice::from_raw_parts_mut(range, len) },
                    None => &mut [],
                }
            }
            Err(e) => {
                log::error!("arena block allocation failed: {}", e);
                &mut []
            }
        }
    }

    /// Copy `src` into the arena and return the arena-owned copy.
    pub fn copy_bytes(&self, src: &[u8]) -> &[u8] {
        let dst = self.alloc_bytes(src.len());
        if dst.len() == src.len() {
            dst.copy_from_slice(src);
        }
        dst
    }

    /// Rewind every block. Requires exclusive access, which guarantees no
    /// allocation from a previous cycle is still live.
    pub fn reset(&mut self) {
        let inner = self.inner.get_mut();
        for block in &mut inner.blocks {
            block.data[..block.used].fill(0);
            block.used = 0;
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        let inner = unsafe { &*self.inner.get() };
        inner.blocks.iter().map(|b| b.used).sum()
    }
}

impl Inner {
    fn try_bump(&mut self, len: usize) -> Option<*mut u8> {
        let block = self.blocks.last_mut()?;
        let aligned = (block.used + DEFAULT_ALIGN - 1) & !(DEFAULT_ALIGN - 1);
        if aligned + len > block.data.len() {
            return None;
        }
        block.used = aligned + len;
        Some(unsafe { block.data.as_mut_ptr().add(aligned) })
    }
}

/// The engine's three arena scopes.
pub struct EngineArenas {
    /// Process-lifetime allocations (module state block).
    pub app: Arena,
    /// Reset at the top of every frame (scratch, file reads).
    pub frame: Arena,
    /// Reset on every swapchain recreation.
    pub swapchain: Arena,
}

impl EngineArenas {
    const APP_BLOCK: usize = 1 << 20;
    const APP_CAP: usize = 256 << 20;
    const FRAME_BLOCK: usize = 4 << 20;
    const FRAME_CAP: usize = 64 << 20;
    const SWAPCHAIN_BLOCK: usize = 64 << 10;
    const SWAPCHAIN_CAP: usize = 4 << 20;

    /// Reserve all three scopes. Failure here is an init failure.
    pub fn new() -> Result<Self, ArenaError> {
        Ok(Self {
            app: Arena::with_capacity(Self::APP_BLOCK, Self::APP_CAP)?,
            frame: Arena::with_capacity(Self::FRAME_BLOCK, Self::FRAME_CAP)?,
            swapchain: Arena::with_capacity(Self::SWAPCHAIN_BLOCK, Self::SWAPCHAIN_CAP)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocations_are_disjoint_and_zeroed() {
        let arena = Arena::with_capacity(256, 1024).unwrap();
        let a = arena.alloc_bytes(32);
        assert_eq!(a.len(), 32);
        assert!(a.iter().all(|&b| b == 0));
        a.fill(0xAB);

        let b = arena.alloc_bytes(32);
        assert_eq!(b.len(), 32);
        assert!(b.iter().all(|&b| b == 0), "second allocation sees no dirt");
    }

    #[test]
    fn allocations_are_aligned() {
        let arena = Arena::with_capacity(256, 1024).unwrap();
        arena.alloc_bytes(3);
        let b = arena.alloc_bytes(8);
        assert_eq!(b.as_ptr() as usize % DEFAULT_ALIGN, 0);
    }

    #[test]
    fn grows_by_chaining_blocks() {
        let arena = Arena::with_capacity(64, 1024).unwrap();
        let a = arena.alloc_bytes(60);
        let b = arena.alloc_bytes(60);
        assert_eq!(a.len(), 60);
        assert_eq!(b.len(), 60);
        assert!(arena.used() >= 120);
    }

    #[test]
    fn exhaustion_returns_empty_slice() {
        let arena = Arena::with_capacity(64, 64).unwrap();
        let a = arena.alloc_bytes(48);
        assert_eq!(a.len(), 48);
        let b = arena.alloc_bytes(128);
        assert!(b.is_empty(), "past the cap the arena hands back a stub");
    }

    #[test]
    fn reset_rewinds_and_rezeroes() {
        let mut arena = Arena::with_capacity(128, 1024).unwrap();
        arena.alloc_bytes(100).fill(0xFF);
        arena.reset();
        assert_eq!(arena.used(), 0);
        let again = arena.alloc_bytes(100);
        assert!(again.iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_bytes_round_trips(){
        let arena = Arena::with_capacity(128, 1024).unwrap();
        let copied = arena.copy_bytes(b"reload me");
        assert_eq!(copied, b"reload me");
    }
}
