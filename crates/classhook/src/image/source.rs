//! Bounds-checked access to a mapped image
//!
//! Everything above the raw bytes (header parsing, RTTI structure reads,
//! pattern scanning) goes through [`ImageSource`] so the same code runs over
//! the live process image and over byte buffers in tests or offline analysis.

use super::module::ModuleInfo;
use super::offset::Ibo32;

/// A readable view of one mapped image, anchored at a base address.
///
/// All offsets are forward indices from the base. Out-of-bounds access
/// returns `None`; nothing here panics on bad input.
pub trait ImageSource {
    /// Base address the image is (or pretends to be) mapped at.
    fn base(&self) -> usize;

    fn size(&self) -> usize;

    /// A borrowed view of `len` bytes at `offset`, or `None` if the range
    /// leaves the image.
    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]>;

    fn read_u16(&self, offset: usize) -> Option<u16> {
        self.bytes(offset, 2)
            .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u32(&self, offset: usize) -> Option<u32> {
        self.bytes(offset, 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_i32(&self, offset: usize) -> Option<i32> {
        self.bytes(offset, 4)
            .map(|b| i32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_usize(&self, offset: usize) -> Option<usize> {
        self.bytes(offset, std::mem::size_of::<usize>())
            .map(|b| usize::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_ibo(&self, offset: usize) -> Option<Ibo32> {
        self.read_i32(offset).map(Ibo32::new)
    }
}

/// The current process's own mapping of a module.
#[derive(Debug, Clone, Copy)]
pub struct LiveImage {
    base: *const u8,
    size: usize,
}

impl LiveImage {
    /// # Safety
    ///
    /// `base..base + size` must stay readable for the lifetime of the view.
    pub unsafe fn new(base: *const u8, size: usize) -> Self {
        Self { base, size }
    }

    /// # Safety
    ///
    /// `info` must describe a module mapped into the current process.
    pub unsafe fn from_module(info: &ModuleInfo) -> Self {
        // SAFETY: caller guarantees the module bounds are valid.
        unsafe { Self::new(info.base as *const u8, info.size) }
    }
}

impl ImageSource for LiveImage {
    fn base(&self) -> usize {
        self.base as usize
    }

    fn size(&self) -> usize {
        self.size
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        // SAFETY: the range is inside the mapping the constructor vouched for.
        Some(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }
}

/// An image held in an owned buffer, used by tests and offline tooling.
///
/// The buffer's own heap address serves as the base so that absolute pointers
/// written into the image (vtable entries, locator pointers) resolve to real
/// memory.
#[derive(Debug)]
pub struct OwnedImage {
    data: Box<[u8]>,
}

impl OwnedImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// Overwrite bytes at `offset`. Panics on out-of-bounds, which is fine
    /// for the image builders this type exists for.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn patch_usize(&mut self, offset: usize, value: usize) {
        self.patch(offset, &value.to_le_bytes());
    }
}

impl ImageSource for OwnedImage {
    fn base(&self) -> usize {
        self.data.as_ptr() as usize
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }
}
