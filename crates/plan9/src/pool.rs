//! Tag and fid number allocators.
//!
//! Both pools hand out the smallest free number, growing only when nothing
//! below the high-water mark is free. The reserved value (`NOTAG`/`NOFID`)
//! is never handed out.

use std::collections::BTreeSet;

use crate::{
    error::Error,
    fcall::{NOFID, NOTAG},
    utils::Result,
};

/// A protocol-visible number managed by an [`IdPool`].
pub trait PoolId: Copy + Ord + std::fmt::Debug {
    /// Never allocated.
    const RESERVED: Self;
    const ZERO: Self;
    /// What running out of these is called in errors.
    const NAME: &'static str;

    fn succ(self) -> Self;
    fn pred(self) -> Self;
}

macro_rules! pool_id {
    ($typ:ty, $reserved:expr, $name:expr) => {
        impl PoolId for $typ {
            const RESERVED: Self = $reserved;
            const ZERO: Self = 0;
            const NAME: &'static str = $name;

            fn succ(self) -> Self {
                self + 1
            }

            fn pred(self) -> Self {
                self - 1
            }
        }
    };
}

pool_id!(u16, NOTAG, "tags");
pool_id!(u32, NOFID, "fids");

#[derive(Debug)]
pub struct IdPool<T> {
    /// Everything at or above `next` is unallocated.
    next: T,
    /// Freed numbers below `next`.
    free: BTreeSet<T>,
    used: usize,
}

impl<T: PoolId> Default for IdPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolId> IdPool<T> {
    pub fn new() -> IdPool<T> {
        IdPool {
            next: T::ZERO,
            free: BTreeSet::new(),
            used: 0,
        }
    }

    pub fn alloc(&mut self) -> Result<T> {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None if self.next == T::RESERVED => return Err(Error::Exhausted(T::NAME)),
            None => {
                let id = self.next;
                self.next = id.succ();
                id
            }
        };
        self.used += 1;
        Ok(id)
    }

    /// Return `id` to the pool. Freeing a number that is not allocated is a no-op.
    pub fn free(&mut self, id: T) {
        if id >= self.next || self.free.contains(&id) {
            log::warn!("free of unallocated {} {:?}", T::NAME, id);
            return;
        }
        self.used -= 1;
        if id.succ() != self.next {
            self.free.insert(id);
            return;
        }

        // Shrink the high-water mark past any trailing free numbers.
        self.next = id;
        while self.next != T::ZERO {
            let below = self.next.pred();
            if !self.free.remove(&below) {
                break;
            }
            self.next = below;
        }
    }

    pub fn in_use(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_unused() {
        let mut pool = IdPool::<u16>::new();
        let ids: Vec<u16> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        pool.free(1);
        pool.free(2);
        assert_eq!(pool.alloc().unwrap(), 1);
        assert_eq!(pool.alloc().unwrap(), 2);
        assert_eq!(pool.alloc().unwrap(), 4);
        assert_eq!(pool.in_use(), 5);
    }

    #[test]
    fn freeing_the_top_shrinks() {
        let mut pool = IdPool::<u32>::new();
        for _ in 0..3 {
            pool.alloc().unwrap();
        }
        pool.free(1);
        pool.free(2);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.alloc().unwrap(), 1);
        pool.free(1);
        pool.free(0);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.alloc().unwrap(), 0);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut pool = IdPool::<u16>::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.free(a);
        pool.free(a);
        pool.free(42);
        assert_eq!(pool.alloc().unwrap(), a);
        assert_ne!(pool.alloc().unwrap(), b);
    }

    #[test]
    fn notag_is_never_allocated() {
        let mut pool = IdPool::<u16>::new();
        for expect in 0..NOTAG {
            assert_eq!(pool.alloc().unwrap(), expect);
        }
        assert!(matches!(pool.alloc(), Err(Error::Exhausted("tags"))));

        pool.free(77);
        assert_eq!(pool.alloc().unwrap(), 77);
        assert!(matches!(pool.alloc(), Err(Error::Exhausted(_))));
    }
}
