use thiserror::Error;

/// Rejections from the range-checked entry points.
///
/// The plain lookups never fail; they mask addresses to the shadowed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShadowError {
    #[error("address {addr:#x} lies outside the {bits}-bit shadowed range")]
    OutOfRange { addr: u64, bits: u32 },
    #[error("{len} addresses starting at {start:#x} overrun the {bits}-bit shadowed range")]
    RangeOverflow { start: u64, len: u64, bits: u32 },
}
