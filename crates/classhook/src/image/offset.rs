//! Image-base-relative offsets
//!
//! MSVC emits 64-bit RTTI structures that reference each other through signed
//! 32-bit displacements from the module load base rather than absolute
//! pointers. `Ibo32` keeps that representation distinct from addresses:
//! conversions in either direction are explicit and always take the base.

use serde::{Deserialize, Serialize};

/// A signed 32-bit displacement from a module base ("image base offset").
///
/// Never an absolute address. Comparisons between offsets are only meaningful
/// when both were computed against the same base.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ibo32(i32);

impl Ibo32 {
    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    /// Compute the offset of `address` relative to `base`.
    ///
    /// The displacement is truncated to 32 bits; for addresses inside a
    /// normally sized module this is lossless.
    pub fn from_address(address: usize, base: usize) -> Self {
        Self(address.wrapping_sub(base) as i32)
    }

    /// Resolve this offset against an explicitly given base address.
    pub fn to_address(self, base: usize) -> usize {
        base.wrapping_add_signed(self.0 as isize)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    /// This offset as a forward index into an image buffer, or `None` if it
    /// points before the base.
    pub fn as_offset(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl std::fmt::Display for Ibo32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 0 {
            write!(f, "-{:#x}", self.0.unsigned_abs())
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}
