//! Runtime view of a decomposition.

use std::fmt;

use crate::addr::{low_mask, shr};
use crate::node::Node;

/// Per-level bit widths of a map shape, most significant level first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Geometry {
    widths: Vec<u32>,
}

impl Geometry {
    pub fn of<D: Node>() -> Self {
        let mut widths = Vec::with_capacity(D::LEVELS as usize);
        D::push_widths(&mut widths);
        Self { widths }
    }

    #[inline]
    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    /// Address bits this shape can shadow.
    pub fn address_bits(&self) -> u32 {
        self.widths.iter().sum()
    }

    #[inline]
    pub fn levels(&self) -> usize {
        self.widths.len()
    }

    #[inline]
    pub fn leaf_width(&self) -> u32 {
        self.widths[self.widths.len() - 1]
    }

    /// Addresses covered by one leaf.
    #[inline]
    pub fn leaf_span(&self) -> u64 {
        low_mask(self.leaf_width()) + 1
    }

    /// Slot that `addr` selects at `level` (0 is the root).
    ///
    /// The terminal level has no slots; its entry is the intra-leaf offset.
    ///
    /// # Panics
    ///
    /// If `level >= self.levels()`.
    pub fn index(&self, level: usize, addr: u64) -> usize {
        let below: u32 = self.widths[level + 1..].iter().sum();
        (shr(addr, below) & low_mask(self.widths[level])) as usize
    }

    #[inline]
    pub fn offset(&self, addr: u64) -> usize {
        (addr & low_mask(self.leaf_width())) as usize
    }

    #[inline]
    pub fn contiguous_elements(&self, addr: u64) -> u64 {
        self.leaf_span() - self.offset(addr) as u64
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, width) in self.widths.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{width}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_level_byte_space() {
        let g = Geometry::of::<crate::decomposition![4, 4]>();
        assert_eq!(g.widths(), &[4, 4]);
        assert_eq!(g.address_bits(), 8);
        assert_eq!(g.index(0, 0x13), 1);
        assert_eq!(g.index(1, 0x13), 3);
        assert_eq!(g.offset(0x13), 3);
        assert_eq!(g.contiguous_elements(0x13), 13);
        assert_eq!(g.to_string(), "4+4");
    }

    #[test]
    fn test_index_is_independent_of_depth_below() {
        let g = Geometry::of::<crate::decomposition![16, 20, 16, 12]>();
        let addr = 0x0000_7fff_1234_5678u64;
        assert_eq!(g.levels(), 4);
        assert_eq!(g.address_bits(), 64);
        assert_eq!(g.index(0, addr), 0x0000);
        assert_eq!(g.index(1, addr), 0x7fff1);
        assert_eq!(g.index(2, addr), 0x2345);
        assert_eq!(g.index(3, addr), 0x678);
        assert_eq!(g.leaf_span(), 4096);
    }
}
