//! MSVC RTTI structure layouts
//!
//! Field layouts match what the 64-bit MSVC toolchain emits. Cross-structure
//! references are image-base-relative [`Ibo32`] values, not pointers. Reads
//! are bounds-checked through the image source rather than cast out of raw
//! buffers.

use crate::image::{Ibo32, ImageSource};

/// `_RTTICompleteObjectLocator`, found one pointer-size slot before a vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteObjectLocator {
    pub signature: u32,
    pub offset: u32,
    pub constructor_displacement: u32,
    pub type_descriptor: Ibo32,
    pub class_descriptor: Ibo32,
}

impl CompleteObjectLocator {
    /// Signature value distinguishing the 64-bit locator form.
    pub const SIGNATURE_64: u32 = 1;

    pub fn read<S: ImageSource>(source: &S, at: Ibo32) -> Option<Self> {
        let offset = at.as_offset()?;
        Some(Self {
            signature: source.read_u32(offset)?,
            offset: source.read_u32(offset + 0x04)?,
            constructor_displacement: source.read_u32(offset + 0x08)?,
            type_descriptor: source.read_ibo(offset + 0x0C)?,
            class_descriptor: source.read_ibo(offset + 0x10)?,
        })
    }
}

/// `_RTTIClassHierarchyDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassHierarchyDescriptor {
    pub signature: u32,
    pub attributes: u32,
    pub base_class_count: u32,
    pub base_class_descriptor: Ibo32,
}

impl ClassHierarchyDescriptor {
    pub fn read<S: ImageSource>(source: &S, at: Ibo32) -> Option<Self> {
        let offset = at.as_offset()?;
        Some(Self {
            signature: source.read_u32(offset)?,
            attributes: source.read_u32(offset + 0x04)?,
            base_class_count: source.read_u32(offset + 0x08)?,
            base_class_descriptor: source.read_ibo(offset + 0x0C)?,
        })
    }
}

/// `_RTTIBaseClassDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseClassDescriptor {
    pub type_descriptor: Ibo32,
    pub contained_base_count: u32,
    /// Member displacement, vbtable displacement, displacement inside vbtable.
    pub displacements: [i32; 3],
    pub attributes: u32,
    pub class_descriptor: Ibo32,
}

impl BaseClassDescriptor {
    pub fn read<S: ImageSource>(source: &S, at: Ibo32) -> Option<Self> {
        let offset = at.as_offset()?;
        Some(Self {
            type_descriptor: source.read_ibo(offset)?,
            contained_base_count: source.read_u32(offset + 0x04)?,
            displacements: [
                source.read_i32(offset + 0x08)?,
                source.read_i32(offset + 0x0C)?,
                source.read_i32(offset + 0x10)?,
            ],
            attributes: source.read_u32(offset + 0x14)?,
            class_descriptor: source.read_ibo(offset + 0x18)?,
        })
    }
}

/// `TypeDescriptor`: two pointer-size fields followed by the nul-terminated
/// mangled type name.
pub struct TypeDescriptor;

impl TypeDescriptor {
    const NAME_OFFSET: usize = 2 * std::mem::size_of::<usize>();

    /// Read the embedded mangled name, capped at `max_len` bytes.
    ///
    /// Returns `None` when the name is empty, unterminated within the cap,
    /// or not valid UTF-8 (mangled MSVC names are always ASCII).
    pub fn read_name<S: ImageSource>(source: &S, at: Ibo32, max_len: usize) -> Option<String> {
        let offset = at.as_offset()?.checked_add(Self::NAME_OFFSET)?;
        let available = source.size().checked_sub(offset)?.min(max_len);
        let bytes = source.bytes(offset, available)?;
        let len = bytes.iter().position(|&b| b == 0)?;
        if len == 0 {
            return None;
        }
        std::str::from_utf8(&bytes[..len]).ok().map(str::to_owned)
    }
}
