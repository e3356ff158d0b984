// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear memory: a growable, page-granular byte buffer with bounds-checked
//! little-endian loads and stores.

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::types::MemType;

use super::Trap;

/// The WebAssembly page size, in bytes.
pub const PAGE_SIZE: usize = 0x1_0000;

/// An instantiated linear memory.
pub struct Memory<A: Allocator> {
    bytes: Vec<u8, A>,
    max_pages: Option<u32>,
}

impl<A: Allocator> Memory<A> {
    /// Allocates a new memory with `ty.min` pages already committed and
    /// zeroed, honoring `ty.max` as the upper bound for `grow`.
    pub(crate) fn new(ty: MemType, alloc: A) -> Result<Self, Trap> {
        let mut bytes = Vec::new_in(alloc);
        let initial_len = ty.min_size_bytes();
        bytes
            .try_reserve_exact(initial_len)
            .map_err(|_| Trap::OutOfMemory)?;
        bytes.resize(initial_len, 0);
        Ok(Self {
            bytes,
            max_pages: ty.max,
        })
    }

    /// The current size, in pages.
    pub fn size(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    /// Grows the memory by `delta` pages of zeroed bytes, returning the
    /// previous page count on success or `None` if the growth would exceed
    /// the declared maximum (or any absolute implementation limit).
    pub(crate) fn grow(&mut self, delta: u32) -> Option<u32> {
        let prev = self.size();
        let new_size = prev.checked_add(delta)?;
        if let Some(max) = self.max_pages
            && new_size > max
        {
            return None;
        }
        // An absolute cap so that a pathological `grow` request can't be used
        // to exhaust the host's address space; 4 GiB is the Wasm 1.0 ceiling
        // anyway (a 32-bit address space).
        const ABSOLUTE_MAX_PAGES: u32 = u16::MAX as u32 + 1;
        if new_size > ABSOLUTE_MAX_PAGES {
            return None;
        }

        let new_len = (new_size as usize) * PAGE_SIZE;
        if self.bytes.try_reserve_exact(new_len - self.bytes.len()).is_err() {
            return None;
        }
        self.bytes.resize(new_len, 0);
        Some(prev)
    }

    /// Returns the full backing buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the full backing buffer, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn effective_range(&self, addr: u32, offset: u32, width: usize) -> Result<core::ops::Range<usize>, Trap> {
        let base = addr
            .checked_add(offset)
            .ok_or(Trap::MemoryOutOfBounds)? as usize;
        let end = base.checked_add(width).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.bytes.len() {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok(base..end)
    }

    /// Reads `N` little-endian bytes at `addr + offset`, trapping if the
    /// access would run past the end of the memory.
    pub(crate) fn load<const N: usize>(&self, addr: u32, offset: u32) -> Result<[u8; N], Trap> {
        let range = self.effective_range(addr, offset, N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[range]);
        Ok(buf)
    }

    /// Writes `bytes` at `addr + offset`, trapping if the access would run
    /// past the end of the memory. Only `bytes.len()` bytes are written;
    /// callers narrow wide values (e.g. `i64.store32`) before calling this.
    pub(crate) fn store(&mut self, addr: u32, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let range = self.effective_range(addr, offset, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `data` into the memory at a fixed offset, used for data-segment
    /// initialization at instantiation time. Traps (as `MemoryOutOfBounds`)
    /// if the segment would run past the end of the memory.
    pub(crate) fn init_segment(&mut self, offset: u32, data: &[u8]) -> Result<(), Trap> {
        self.store(offset, 0, data)
    }
}
