// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Emits the engine's internal re-encoded [`Expression`] byte format from
//! parsed instructions, mirroring `crate::decode::expr`'s transcoder but
//! writing values the parser already has in hand rather than transcoding
//! them off a binary stream. See [`Expression`]'s docstring for the exact
//! layout being produced.

use core::ptr;

use crate::Allocator;
use crate::core_compat;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::alloc::{AllocError, Layout};
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;
use crate::types::{BrTableOperands, Expression, LabelIdx};

const MAX_NATURAL_ALIGNMENT: usize = 8;

#[derive(Clone)]
struct AlignedAllocator<A: Allocator>(A);

// Safety: Soundness is deferred to the wrapped allocator.
unsafe impl<A: Allocator> core_compat::alloc::Allocator for AlignedAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<ptr::NonNull<[u8]>, AllocError> {
        let layout = layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        self.0.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: ptr::NonNull<u8>, layout: Layout) {
        let layout = layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        // Safety: Soundness is deferred to the wrapped allocator.
        unsafe { self.0.deallocate(ptr, layout) }
    }

    unsafe fn grow(
        &self,
        ptr: ptr::NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<ptr::NonNull<[u8]>, AllocError> {
        let old_layout = old_layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        let new_layout = new_layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        // Safety: Soundness is deferred to the wrapped allocator.
        unsafe { self.0.grow(ptr, old_layout, new_layout) }
    }

    unsafe fn shrink(
        &self,
        ptr: ptr::NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<ptr::NonNull<[u8]>, AllocError> {
        let old_layout = old_layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        let new_layout = new_layout.align_to(MAX_NATURAL_ALIGNMENT).unwrap();
        // Safety: Soundness is deferred to the wrapped allocator.
        unsafe { self.0.shrink(ptr, old_layout, new_layout) }
    }
}

/// A value that can be appended to an in-progress [`Expression`] encoding.
pub(super) trait Writable: Copy {}

impl Writable for crate::types::Opcode {}
impl Writable for crate::types::BlockType {}
impl Writable for crate::types::MemArg {}
impl Writable for crate::types::CallIndirectOperands {}
impl Writable for crate::types::BulkOpcode {}
impl Writable for u32 {}
impl Writable for i32 {}
impl Writable for i64 {}
impl Writable for f32 {}
impl Writable for f64 {}
impl Writable for LabelIdx {}

pub(super) struct ExpressionBuilder<A: Allocator> {
    data: Vec<u8, AlignedAllocator<A>>,
}

impl<A: Allocator> ExpressionBuilder<A> {
    pub(super) fn new(alloc: A) -> Self {
        let aligned_alloc = AlignedAllocator(alloc);
        Self {
            data: Vec::new_in(aligned_alloc),
        }
    }

    pub(super) fn finalize(self) -> Expression<A> {
        let (ptr, len, _, alloc) = self.data.into_raw_parts_with_alloc();
        let ptr: *mut [u8] = ptr::slice_from_raw_parts_mut(ptr, len);
        // Safety: The allocation is truly being managed by the wrapped
        // allocator A.
        unsafe { Expression::new(Box::from_raw_in(ptr, alloc.0)) }
    }

    pub(super) fn write<T: Writable>(&mut self, value: T) -> Result<(), TryReserveError> {
        let data = &mut self.data;

        // The alignment of `data`'s allocation ensures that the byte at
        // `aligned_pos` has T's natural alignment.
        let pos = data.len();
        let aligned_pos = pos.next_multiple_of(align_of::<T>());
        let padding = aligned_pos - pos;
        data.try_reserve_exact(padding + size_of::<T>())?;
        if padding > 0 {
            data.resize(pos + padding, 0);
        }

        // Safety: Per the above, the address being written to has T's
        // natural alignment, and the call to try_reserve_exact() ensures
        // that the capacity is `aligned_pos + size_of::<T>()`.
        unsafe {
            let write_ptr = data.as_mut_ptr().add(aligned_pos);
            write_ptr.cast::<T>().write(value);
            data.set_len(aligned_pos + size_of::<T>());
        }
        Ok(())
    }

    // A vector operand is encoded as a u32 count followed by the elements,
    // matching `decode::expr`'s `Transcodable` impl for `Vec<T, A>`.
    pub(super) fn write_vec<T: Writable>(&mut self, values: &[T]) -> Result<(), TryReserveError> {
        self.write(values.len() as u32)?;
        for &value in values {
            self.write(value)?;
        }
        Ok(())
    }

    pub(super) fn write_br_table(
        &mut self,
        operands: &BrTableOperands<A>,
    ) -> Result<(), TryReserveError> {
        self.write_vec(&operands.labels)?;
        self.write(operands.default)
    }
}
