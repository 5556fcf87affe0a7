//! Typed object pool layered over [`BlockPool`].

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::BlockPool;

/// An object pool for values of type `T`.
///
/// Values are placement-constructed into pool blocks on
/// [`allocate`](Self::allocate) and dropped in place on
/// [`deallocate`](Self::deallocate). The backing blocks are recycled
/// through the pool's free list; chunk memory is only released when the
/// pool itself is dropped, so the owner must deallocate every live value
/// before dropping the pool or the values leak (they are never
/// double-freed).
pub struct TypedPool<T> {
    pool: BlockPool,
    _marker: PhantomData<T>,
}

impl<T> TypedPool<T> {
    /// Create an empty pool for `T`.
    pub fn new() -> Self {
        Self {
            pool: BlockPool::new(size_of::<T>(), align_of::<T>()),
            _marker: PhantomData,
        }
    }

    /// Move `value` into a pool block and return a pointer to it.
    pub fn allocate(&mut self, value: T) -> NonNull<T> {
        let block = self.pool.allocate().cast::<T>();
        // SAFETY: the block is block_size >= size_of::<T>() bytes,
        // aligned for T, and not referenced by anything else.
        unsafe { block.as_ptr().write(value) };
        block
    }

    /// Drop the value in place and return its block to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this pool and must not have been deallocated since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<T>) {
        // SAFETY: caller guarantees the pointer holds a live T from
        // this pool.
        unsafe {
            ptr.as_ptr().drop_in_place();
            self.pool.deallocate(ptr.cast());
        }
    }

    /// Number of live values.
    pub fn live(&self) -> usize {
        self.pool.live_blocks()
    }
}

impl<T> Default for TypedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
