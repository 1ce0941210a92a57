//! Metadata records stored in leaves.

/// The per-leaf metadata a host attaches to a block of addresses.
///
/// A record covers every address of its leaf; hosts usually make it an
/// array (or a struct of arrays) indexed by [`ShadowMap::offset`].
///
/// [`ShadowMap::offset`]: crate::ShadowMap::offset
pub trait ShadowRecord: Sized {
    /// Builds the record of a freshly allocated leaf. Runs exactly once per
    /// leaf.
    fn initialize() -> Self;

    /// Runs exactly once when the owning map is torn down, before the record
    /// is dropped and its storage released.
    #[inline]
    fn finalize(&mut self) {}
}

/// One entry per covered address, each starting at `T::default()`.
///
/// The array is built by value, so very wide leaves should prefer a record
/// that initializes on the heap.
impl<T: Copy + Default, const N: usize> ShadowRecord for [T; N] {
    #[inline]
    fn initialize() -> Self {
        [T::default(); N]
    }
}
