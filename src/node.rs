//! Compile-time recursive node shapes.
//!
//! A decomposition is a nested type such as `Level<20, Level<16, Leaf<12>>>`
//! (see [`decomposition!`](crate::decomposition)). Each `Level<W, _>`
//! consumes the next `W` address bits, most significant first, to pick one
//! of `2^W` child slots; the terminal `Leaf<W>` holds a single record for
//! the remaining `W` bits.
//!
//! Node storage is a bare array of cells acquired from the map's allocator:
//! `2^W` child slots for a level, one record for a leaf. A pointer to the
//! first cell is the node handle its parent stores.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::addr::{shl, shr};
use crate::alloc::ShadowAlloc;
use crate::record::ShadowRecord;

mod sealed {
    pub trait Sealed {}
}

/// An interior level routing on `W` address bits to `2^W` children of shape
/// `Lower`.
pub struct Level<const W: u32, Lower>(PhantomData<Lower>);

/// The terminal level: one record covering `2^W` consecutive addresses.
pub struct Leaf<const W: u32>;

/// Nodes a parent has allocated below the root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowStats {
    /// Interior nodes.
    pub levels: usize,
    pub leaves: usize,
    /// Bytes acquired from the allocator.
    pub bytes: usize,
}

impl ShadowStats {
    #[inline]
    pub fn nodes(&self) -> usize {
        self.levels + self.leaves
    }
}

/// A child slot: absent, or exclusive ownership of one live node of shape
/// `L`.
pub type Slot<L, R> = Option<NonNull<<L as Node>::Cell<R>>>;

/// Shape of one node and, recursively, everything beneath it.
///
/// Sealed; implemented by [`Level`] and [`Leaf`] only. The unsafe methods
/// are the map's internals and share one invariant: a node handle refers
/// to fully initialized storage for `CELLS` cells, exclusively owned by the
/// slot (or root) it was read from.
pub trait Node: sealed::Sealed + 'static {
    /// Address bits consumed at this level.
    const WIDTH: u32;
    /// Address bits consumed by this level and every level below it.
    const BITS: u32;
    /// Width of the terminal level.
    const LEAF_WIDTH: u32;
    /// Number of levels from here down, the leaf included.
    const LEVELS: u32;
    /// Cells per node: `2^WIDTH` for a level, 1 for a leaf.
    const CELLS: usize;

    /// Storage unit: a child slot for a level, the record itself for a leaf.
    type Cell<R: ShadowRecord>;

    #[doc(hidden)]
    fn push_widths(out: &mut Vec<u32>);

    /// # Safety
    ///
    /// `cells` is writable, aligned, uninitialized storage for `CELLS` cells.
    #[doc(hidden)]
    unsafe fn init<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>);

    /// Tears down everything the node owns, leaving its storage
    /// uninitialized.
    ///
    /// # Safety
    ///
    /// `cells` is a live node allocated from `alloc`.
    #[doc(hidden)]
    unsafe fn clear<R: ShadowRecord, M: ShadowAlloc>(cells: NonNull<Self::Cell<R>>, alloc: &M);

    /// # Safety
    ///
    /// `cells` is a live node.
    #[doc(hidden)]
    unsafe fn leaf<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>, addr: u64) -> Option<NonNull<R>>;

    /// # Safety
    ///
    /// `cells` is a live node allocated from `alloc`, and no reference into
    /// it is held elsewhere.
    #[doc(hidden)]
    unsafe fn leaf_for_write<R: ShadowRecord, M: ShadowAlloc>(
        cells: NonNull<Self::Cell<R>>,
        addr: u64,
        alloc: &M,
        stats: &mut ShadowStats,
    ) -> NonNull<R>;

    /// Calls `f` with every live leaf's base address, in ascending order.
    ///
    /// # Safety
    ///
    /// `cells` is a live node.
    #[doc(hidden)]
    unsafe fn visit<R: ShadowRecord>(
        cells: NonNull<Self::Cell<R>>,
        base: u64,
        f: &mut dyn FnMut(u64, NonNull<R>),
    );
}

/// A shape with child slots; maps are rooted at one.
pub trait Interior: Node {
    type Lower: Node;
}

const fn fan_out(width: u32) -> usize {
    assert!(width < usize::BITS, "level width exceeds the pointer width");
    1usize << width
}

impl<const W: u32, L> sealed::Sealed for Level<W, L> {}
impl<const W: u32> sealed::Sealed for Leaf<W> {}

impl<const W: u32, L: Node> Interior for Level<W, L> {
    type Lower = L;
}

impl<const W: u32, L: Node> Node for Level<W, L> {
    const WIDTH: u32 = W;
    const BITS: u32 = W + L::BITS;
    const LEAF_WIDTH: u32 = L::LEAF_WIDTH;
    const LEVELS: u32 = L::LEVELS + 1;
    const CELLS: usize = fan_out(W);

    type Cell<R: ShadowRecord> = Slot<L, R>;

    fn push_widths(out: &mut Vec<u32>) {
        out.push(W);
        L::push_widths(out);
    }

    #[inline]
    unsafe fn init<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>) {
        let slots = cells.as_ptr();
        for i in 0..Self::CELLS {
            // SAFETY: `i < CELLS`, within the caller's storage.
            unsafe { slots.add(i).write(None) };
        }
    }

    unsafe fn clear<R: ShadowRecord, M: ShadowAlloc>(cells: NonNull<Self::Cell<R>>, alloc: &M) {
        // SAFETY: a live level holds `CELLS` initialized slots.
        let slots = unsafe { std::slice::from_raw_parts_mut(cells.as_ptr(), Self::CELLS) };
        unsafe { teardown::<L, R, M>(slots, alloc) }
    }

    #[inline]
    unsafe fn leaf<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>, addr: u64) -> Option<NonNull<R>> {
        // SAFETY: see `clear`.
        let slots = unsafe { std::slice::from_raw_parts(cells.as_ptr(), Self::CELLS) };
        unsafe { lookup::<L, R>(slots, addr) }
    }

    #[inline]
    unsafe fn leaf_for_write<R: ShadowRecord, M: ShadowAlloc>(
        cells: NonNull<Self::Cell<R>>,
        addr: u64,
        alloc: &M,
        stats: &mut ShadowStats,
    ) -> NonNull<R> {
        // SAFETY: see `clear`; the caller guarantees exclusive access.
        let slots = unsafe { std::slice::from_raw_parts_mut(cells.as_ptr(), Self::CELLS) };
        unsafe { lookup_for_write::<L, R, M>(slots, addr, alloc, stats) }
    }

    unsafe fn visit<R: ShadowRecord>(
        cells: NonNull<Self::Cell<R>>,
        base: u64,
        f: &mut dyn FnMut(u64, NonNull<R>),
    ) {
        // SAFETY: see `clear`.
        let slots = unsafe { std::slice::from_raw_parts(cells.as_ptr(), Self::CELLS) };
        unsafe { walk::<L, R>(slots, base, f) }
    }
}

impl<const W: u32> Node for Leaf<W> {
    const WIDTH: u32 = W;
    const BITS: u32 = W;
    const LEAF_WIDTH: u32 = {
        assert!(W < u64::BITS, "leaf width must be below 64 bits");
        W
    };
    const LEVELS: u32 = 1;
    const CELLS: usize = 1;

    type Cell<R: ShadowRecord> = R;

    fn push_widths(out: &mut Vec<u32>) {
        out.push(W);
    }

    #[inline]
    unsafe fn init<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>) {
        // SAFETY: caller provides storage for one record.
        unsafe { cells.as_ptr().write(R::initialize()) }
    }

    unsafe fn clear<R: ShadowRecord, M: ShadowAlloc>(cells: NonNull<Self::Cell<R>>, _alloc: &M) {
        // SAFETY: the record is live and owned by this leaf.
        unsafe {
            (*cells.as_ptr()).finalize();
            ptr::drop_in_place(cells.as_ptr());
        }
    }

    #[inline]
    unsafe fn leaf<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>, _addr: u64) -> Option<NonNull<R>> {
        Some(cells)
    }

    #[inline]
    unsafe fn leaf_for_write<R: ShadowRecord, M: ShadowAlloc>(
        cells: NonNull<Self::Cell<R>>,
        _addr: u64,
        _alloc: &M,
        _stats: &mut ShadowStats,
    ) -> NonNull<R> {
        cells
    }

    unsafe fn visit<R: ShadowRecord>(cells: NonNull<Self::Cell<R>>, base: u64, f: &mut dyn FnMut(u64, NonNull<R>)) {
        f(base, cells)
    }
}

// =============================================================================
// Slot arrays
// =============================================================================
//
// Shared by allocated levels and by the map's root array, which has the same
// layout but lives in the map itself.

#[inline]
fn slot_index<L: Node>(fan_out: usize, addr: u64) -> usize {
    debug_assert!(fan_out.is_power_of_two());
    (shr(addr, L::BITS) & (fan_out as u64 - 1)) as usize
}

/// # Safety
///
/// Every present slot holds a live node.
#[inline]
pub(crate) unsafe fn lookup<L: Node, R: ShadowRecord>(slots: &[Slot<L, R>], addr: u64) -> Option<NonNull<R>> {
    let child = slots[slot_index::<L>(slots.len(), addr)]?;
    // SAFETY: present slots hold live nodes.
    unsafe { L::leaf(child, addr) }
}

/// # Safety
///
/// Every present slot holds a live node allocated from `alloc`, and the
/// caller has exclusive access to the whole tree below `slots`.
#[inline]
pub(crate) unsafe fn lookup_for_write<L: Node, R: ShadowRecord, M: ShadowAlloc>(
    slots: &mut [Slot<L, R>],
    addr: u64,
    alloc: &M,
    stats: &mut ShadowStats,
) -> NonNull<R> {
    let index = slot_index::<L>(slots.len(), addr);
    let child = match slots[index] {
        Some(child) => child,
        None => {
            let child = create::<L, R, M>(alloc, stats);
            slots[index] = Some(child);
            child
        }
    };
    // SAFETY: `child` is live and reachable only through `slots`.
    unsafe { L::leaf_for_write(child, addr, alloc, stats) }
}

/// Destroys every present child, children before the array that held them.
///
/// # Safety
///
/// As for [`lookup_for_write`].
pub(crate) unsafe fn teardown<L: Node, R: ShadowRecord, M: ShadowAlloc>(slots: &mut [Slot<L, R>], alloc: &M) {
    for slot in slots.iter_mut() {
        if let Some(child) = slot.take() {
            // SAFETY: taking the slot leaves no other handle to `child`.
            unsafe { destroy::<L, R, M>(child, alloc) }
        }
    }
}

/// # Safety
///
/// Every present slot holds a live node.
pub(crate) unsafe fn walk<L: Node, R: ShadowRecord>(
    slots: &[Slot<L, R>],
    base: u64,
    f: &mut dyn FnMut(u64, NonNull<R>),
) {
    for (i, slot) in slots.iter().enumerate() {
        if let Some(child) = *slot {
            // SAFETY: present slots hold live nodes.
            unsafe { L::visit(child, base | shl(i as u64, L::BITS), f) }
        }
    }
}

// =============================================================================
// Node lifecycle
// =============================================================================

fn node_layout<L: Node, R: ShadowRecord>() -> Layout {
    match Layout::array::<L::Cell<R>>(L::CELLS) {
        Ok(layout) => layout,
        Err(_) => panic!("shadow node of {} cells overflows isize", L::CELLS),
    }
}

/// Acquires and initializes one node. Zero-sized leaves never reach the
/// allocator.
fn create<L: Node, R: ShadowRecord, M: ShadowAlloc>(alloc: &M, stats: &mut ShadowStats) -> NonNull<L::Cell<R>> {
    let layout = node_layout::<L, R>();
    let cells = if layout.size() == 0 {
        NonNull::dangling()
    } else {
        alloc.acquire(layout).cast()
    };
    // SAFETY: fresh storage sized and aligned for `L::CELLS` cells.
    unsafe { L::init(cells) };

    if L::LEVELS == 1 {
        stats.leaves += 1;
    } else {
        stats.levels += 1;
    }
    stats.bytes += layout.size();
    tracing::trace!(
        levels_below = L::LEVELS - 1,
        bytes = layout.size(),
        "allocated shadow node"
    );
    cells
}

/// # Safety
///
/// `cells` is a live node allocated from `alloc` with no other handle.
unsafe fn destroy<L: Node, R: ShadowRecord, M: ShadowAlloc>(cells: NonNull<L::Cell<R>>, alloc: &M) {
    // SAFETY: forwarded.
    unsafe { L::clear(cells, alloc) };
    let layout = node_layout::<L, R>();
    if layout.size() != 0 {
        // SAFETY: acquired in `create` with the same layout.
        unsafe { alloc.release(cells.cast(), layout) };
    }
}

/// Names a nested [`Level`]/[`Leaf`] shape from its widths, most
/// significant first.
///
/// ```rust
/// use shadow_map::{decomposition, Leaf, Level};
///
/// type Shape = decomposition![20, 16, 12];
/// let _: Option<Level<20, Level<16, Leaf<12>>>> = None::<Shape>;
/// ```
#[macro_export]
macro_rules! decomposition {
    ($width:expr $(,)?) => {
        $crate::Leaf<{ $width }>
    };
    ($width:expr, $($rest:expr),+ $(,)?) => {
        $crate::Level<{ $width }, $crate::decomposition!($($rest),+)>
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    type Shape = crate::decomposition![4, 8, 4];

    #[test]
    fn test_shape_constants() {
        assert_eq!(Shape::BITS, 16);
        assert_eq!(Shape::LEVELS, 3);
        assert_eq!(Shape::LEAF_WIDTH, 4);
        assert_eq!(Shape::CELLS, 16);
        assert_eq!(<<Shape as Interior>::Lower as Node>::CELLS, 256);
        assert_eq!(<Leaf<4> as Node>::CELLS, 1);
    }

    #[test]
    fn test_slot_index_takes_own_bit_slice() {
        // 0xABCD under 4+8+4: top nibble, middle byte, low nibble.
        assert_eq!(slot_index::<Level<8, Leaf<4>>>(16, 0xABCD), 0xA);
        assert_eq!(slot_index::<Leaf<4>>(256, 0xABCD), 0xBC);
        // Bits above the configured range are masked off.
        assert_eq!(slot_index::<Level<8, Leaf<4>>>(16, 0x1_ABCD), 0xA);
    }

    #[test]
    fn test_zero_sized_leaf_skips_allocator() {
        struct Marker;
        impl ShadowRecord for Marker {
            fn initialize() -> Self {
                Marker
            }
        }

        assert_eq!(node_layout::<Leaf<3>, Marker>().size(), 0);
        assert_eq!(
            node_layout::<Level<3, Leaf<3>>, Marker>().size(),
            8 * std::mem::size_of::<usize>()
        );
    }
}
