//! # shadow-map
//!
//! A sparse, lazily allocated multi-level map from machine addresses to
//! per-address shadow metadata, for memory checkers, taint trackers and
//! similar dynamic-analysis tools.
//!
//! The address is split into bit slices, most significant first. Every
//! interior level spends its slice picking one of `2^W` children; the
//! terminal leaf holds one caller-defined record covering the remaining
//! `2^W` addresses, indexed by [`ShadowMap::offset`]. Nodes below the root
//! are only allocated the first time a write touches their range, and are
//! never freed before the whole map is dropped.
//!
//! ## Example
//!
//! ```rust
//! use shadow_map::{decomposition, ShadowMap};
//!
//! type Map = ShadowMap<u8, [u8; 16], decomposition![4, 4]>;
//!
//! let mut map = Map::new();
//! assert!(map.leaf(0x13).is_none());
//!
//! map.leaf_for_write(0x13)[Map::offset(0x13)] = 7;
//!
//! assert_eq!(map.leaf(0x13).map(|r| r[Map::offset(0x13)]), Some(7));
//! assert_eq!(Map::contiguous_elements(0x13), 13);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod addr;
mod alloc;
mod error;
mod geometry;
mod node;
mod record;

pub use addr::Address;
pub use alloc::{ApiAlloc, Global, ShadowAlloc};
pub use error::ShadowError;
pub use geometry::Geometry;
pub use node::{Interior, Leaf, Level, Node, ShadowStats};
pub use record::ShadowRecord;

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

use addr::{low_mask, shr};
use node::Slot;

// =============================================================================
// ShadowMap
// =============================================================================

/// Shadow memory for addresses of type `A`, one record `R` per leaf of the
/// decomposition `D`, nodes drawn from allocator `M`.
///
/// The root slot array lives in the map itself; everything below it is
/// acquired from `M` on demand and handed back when the map is dropped,
/// children before the node that owns them.
///
/// Mutation requires `&mut self`. The map is [`Send`]/[`Sync`] exactly when
/// `R` and `M` are, so sharing it across threads takes an outer lock for
/// writers.
pub struct ShadowMap<A, R, D, M = Global>
where
    R: ShadowRecord,
    D: Interior,
    M: ShadowAlloc,
{
    root: Box<[Slot<D::Lower, R>]>,
    stats: ShadowStats,
    alloc: M,
    _marker: PhantomData<(fn() -> A, R, D)>,
}

// SAFETY: the map exclusively owns every node and record it points at.
unsafe impl<A, R, D, M> Send for ShadowMap<A, R, D, M>
where
    R: ShadowRecord + Send,
    D: Interior,
    M: ShadowAlloc + Send,
{
}

// SAFETY: `&self` methods never mutate the tree and only hand out `&R`/`&M`.
unsafe impl<A, R, D, M> Sync for ShadowMap<A, R, D, M>
where
    R: ShadowRecord + Sync,
    D: Interior,
    M: ShadowAlloc + Sync,
{
}

impl<A: Address, R: ShadowRecord, D: Interior> ShadowMap<A, R, D> {
    pub fn new() -> Self {
        Self::with_allocator(Global)
    }
}

impl<A, R, D, M> ShadowMap<A, R, D, M>
where
    A: Address,
    R: ShadowRecord,
    D: Interior,
    M: ShadowAlloc,
{
    const LAYOUT_OK: () = {
        assert!(D::BITS <= A::BITS, "decomposition is wider than the address type");
        assert!(D::LEAF_WIDTH < usize::BITS, "leaf width exceeds the pointer width");
    };

    pub fn with_allocator(alloc: M) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::LAYOUT_OK;

        let root: Box<[Slot<D::Lower, R>]> = (0..D::CELLS).map(|_| None).collect();
        tracing::debug!(
            geometry = %Self::geometry(),
            address_bits = A::BITS,
            "created shadow map"
        );
        Self {
            root,
            stats: ShadowStats::default(),
            alloc,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn allocator(&self) -> &M {
        &self.alloc
    }

    /// Nodes allocated so far below the root.
    #[inline]
    pub fn stats(&self) -> ShadowStats {
        self.stats
    }

    pub fn geometry() -> Geometry {
        Geometry::of::<D>()
    }

    /// Record shadowing `addr`, or `None` if its leaf was never written.
    ///
    /// Bits of `addr` above the decomposition's width are ignored.
    #[inline]
    pub fn leaf(&self, addr: A) -> Option<&R> {
        // SAFETY: root slots only hold live nodes owned by `self`.
        let rec = unsafe { node::lookup::<D::Lower, R>(&self.root, addr.to_u64()) }?;
        // SAFETY: the record lives as long as the map; `&self` excludes writers.
        Some(unsafe { &*rec.as_ptr() })
    }

    #[inline]
    pub fn leaf_mut(&mut self, addr: A) -> Option<&mut R> {
        // SAFETY: as for `leaf`, and `&mut self` makes the access exclusive.
        let rec = unsafe { node::lookup::<D::Lower, R>(&self.root, addr.to_u64()) }?;
        Some(unsafe { &mut *rec.as_ptr() })
    }

    /// Record shadowing `addr`, allocating the missing nodes on its path.
    ///
    /// Bits of `addr` above the decomposition's width are ignored.
    #[inline]
    pub fn leaf_for_write(&mut self, addr: A) -> &mut R {
        // SAFETY: root slots only hold live nodes acquired from `self.alloc`,
        // and `&mut self` makes the access exclusive.
        let rec = unsafe {
            node::lookup_for_write::<D::Lower, R, M>(
                &mut self.root,
                addr.to_u64(),
                &self.alloc,
                &mut self.stats,
            )
        };
        unsafe { &mut *rec.as_ptr() }
    }

    #[inline]
    pub fn contains(&self, addr: A) -> bool {
        self.leaf(addr).is_some()
    }

    fn check(addr: A) -> Result<A, ShadowError> {
        let raw = addr.to_u64();
        if shr(raw, D::BITS) != 0 {
            return Err(ShadowError::OutOfRange {
                addr: raw,
                bits: D::BITS,
            });
        }
        Ok(addr)
    }

    /// Like [`leaf`](Self::leaf), rejecting addresses beyond the shadowed
    /// width instead of masking them.
    pub fn checked_leaf(&self, addr: A) -> Result<Option<&R>, ShadowError> {
        Self::check(addr).map(|addr| self.leaf(addr))
    }

    pub fn checked_leaf_for_write(&mut self, addr: A) -> Result<&mut R, ShadowError> {
        let addr = Self::check(addr)?;
        Ok(self.leaf_for_write(addr))
    }

    /// Position of `addr` within its leaf's record. No allocation involved.
    #[inline]
    pub fn offset(addr: A) -> usize {
        (addr.to_u64() & low_mask(D::LEAF_WIDTH)) as usize
    }

    /// How many addresses starting at `addr` share its leaf.
    #[inline]
    pub fn contiguous_elements(addr: A) -> usize {
        (1usize << D::LEAF_WIDTH) - Self::offset(addr)
    }

    /// First address covered by the leaf that covers `addr`.
    #[inline]
    pub fn leaf_base(addr: A) -> A {
        A::from_u64(addr.to_u64() & !low_mask(D::LEAF_WIDTH))
    }

    fn check_run(start: A, len: u64) -> Result<(), ShadowError> {
        if len == 0 {
            return Ok(());
        }
        let start = start.to_u64();
        let overrun = ShadowError::RangeOverflow {
            start,
            len,
            bits: D::BITS,
        };
        let last = start.checked_add(len - 1).ok_or(overrun)?;
        if shr(last, D::BITS) != 0 {
            return Err(overrun);
        }
        Ok(())
    }

    /// Walks `len` addresses from `start` one leaf-sized run at a time.
    ///
    /// `f` receives the first address of the run, its record (`None` while
    /// unmapped) and the run's offsets within that record.
    pub fn for_each_run<F>(&self, start: A, len: u64, mut f: F) -> Result<(), ShadowError>
    where
        F: FnMut(A, Option<&R>, Range<usize>),
    {
        Self::check_run(start, len)?;
        let mut addr = start.to_u64();
        let mut remaining = len;
        while remaining > 0 {
            let at = A::from_u64(addr);
            let offset = Self::offset(at);
            let run = (Self::contiguous_elements(at) as u64).min(remaining);
            f(at, self.leaf(at), offset..offset + run as usize);
            remaining -= run;
            addr = addr.wrapping_add(run);
        }
        Ok(())
    }

    /// Allocating counterpart of [`for_each_run`](Self::for_each_run).
    pub fn for_each_run_mut<F>(&mut self, start: A, len: u64, mut f: F) -> Result<(), ShadowError>
    where
        F: FnMut(A, &mut R, Range<usize>),
    {
        Self::check_run(start, len)?;
        let mut addr = start.to_u64();
        let mut remaining = len;
        while remaining > 0 {
            let at = A::from_u64(addr);
            let offset = Self::offset(at);
            let run = (Self::contiguous_elements(at) as u64).min(remaining);
            f(at, self.leaf_for_write(at), offset..offset + run as usize);
            remaining -= run;
            addr = addr.wrapping_add(run);
        }
        Ok(())
    }

    /// Visits every allocated leaf in ascending address order, passing the
    /// leaf's base address.
    pub fn for_each_leaf<F>(&self, mut f: F)
    where
        F: FnMut(A, &R),
    {
        let mut visit = |base: u64, rec: std::ptr::NonNull<R>| {
            // SAFETY: live record, shared for the duration of `&self`.
            f(A::from_u64(base), unsafe { &*rec.as_ptr() })
        };
        // SAFETY: root slots only hold live nodes.
        unsafe { node::walk::<D::Lower, R>(&self.root, 0, &mut visit) }
    }

    pub fn for_each_leaf_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(A, &mut R),
    {
        let mut visit = |base: u64, rec: std::ptr::NonNull<R>| {
            // SAFETY: each leaf is visited once and `&mut self` is exclusive.
            f(A::from_u64(base), unsafe { &mut *rec.as_ptr() })
        };
        // SAFETY: root slots only hold live nodes.
        unsafe { node::walk::<D::Lower, R>(&self.root, 0, &mut visit) }
    }
}

impl<A, R, D, M> Default for ShadowMap<A, R, D, M>
where
    A: Address,
    R: ShadowRecord,
    D: Interior,
    M: ShadowAlloc + Default,
{
    fn default() -> Self {
        Self::with_allocator(M::default())
    }
}

impl<A, R, D, M> Drop for ShadowMap<A, R, D, M>
where
    R: ShadowRecord,
    D: Interior,
    M: ShadowAlloc,
{
    fn drop(&mut self) {
        tracing::debug!(
            levels = self.stats.levels,
            leaves = self.stats.leaves,
            bytes = self.stats.bytes,
            "tearing down shadow map"
        );
        // SAFETY: root slots only hold live nodes acquired from `self.alloc`;
        // nothing can observe the tree after this point.
        unsafe { node::teardown::<D::Lower, R, M>(&mut self.root, &self.alloc) }
    }
}

impl<A, R, D, M> fmt::Debug for ShadowMap<A, R, D, M>
where
    R: ShadowRecord,
    D: Interior,
    M: ShadowAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowMap")
            .field("geometry", &Geometry::of::<D>())
            .field("stats", &self.stats)
            .finish()
    }
}


#[cfg(test)]
mod proptests;
