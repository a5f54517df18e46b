//! In-memory PE image mapping
//!
//! [`ImageMap`] walks the headers of an already-mapped image and exposes its
//! sections as named, base-relative ranges. It holds no raw pointers itself;
//! memory access happens through an [`ImageSource`] and addresses only exist
//! relative to the module info established via [`ImageMap::resolve`].

mod module;
mod offset;
mod section;
mod source;

pub use module::ModuleInfo;
pub use offset::Ibo32;
pub use section::{Section, SectionMap, sections_contain};
pub use source::{ImageSource, LiveImage, OwnedImage};

use tracing::{debug, warn};

use crate::error::{Error, Result};

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const PE_MAGIC: u32 = 0x4550; // "PE\0\0"
const E_LFANEW: usize = 0x3C;
const SECTION_HEADER_SIZE: usize = 0x28;

/// Section layout of one mapped image plus the module it belongs to.
#[derive(Debug, Default)]
pub struct ImageMap {
    module: Option<ModuleInfo>,
    sections: Option<SectionMap>,
}

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the given module info, or query the OS when none is supplied.
    ///
    /// Replacing the module invalidates any previously parsed section map;
    /// call [`ImageMap::parse`] again afterwards. A failed OS query leaves
    /// the map in the no-module state.
    pub fn resolve(&mut self, info: Option<ModuleInfo>) -> Option<&ModuleInfo> {
        self.sections = None;
        self.module = match info {
            Some(info) => Some(info),
            None => ModuleInfo::current_process(),
        };
        self.module.as_ref()
    }

    pub fn module(&self) -> Option<&ModuleInfo> {
        self.module.as_ref()
    }

    pub fn base(&self) -> Option<usize> {
        self.module.map(|m| m.base)
    }

    /// Resolve a relative offset to an absolute address.
    ///
    /// This is the one loud failure path: guessing a base would silently
    /// produce wild pointers, so without established module info this
    /// returns [`Error::NoModuleInfo`].
    pub fn address_of(&self, ibo: Ibo32) -> Result<usize> {
        let base = self.base().ok_or(Error::NoModuleInfo)?;
        Ok(ibo.to_address(base))
    }

    /// Inverse of [`ImageMap::address_of`].
    pub fn offset_of(&self, address: usize) -> Result<Ibo32> {
        let base = self.base().ok_or(Error::NoModuleInfo)?;
        Ok(Ibo32::from_address(address, base))
    }

    /// Parse the image headers and rebuild the section map.
    ///
    /// Returns `false` on any malformed or truncated header without
    /// panicking; the previous section map is discarded either way.
    pub fn parse<S: ImageSource>(&mut self, source: &S) -> bool {
        match self.parse_checked(source) {
            Ok(count) => {
                debug!(sections = count, "parsed image section table");
                true
            }
            Err(e) => {
                warn!("image parse failed: {e}");
                false
            }
        }
    }

    /// [`ImageMap::parse`] with the concrete failure reason.
    pub fn parse_checked<S: ImageSource>(&mut self, source: &S) -> Result<usize> {
        self.sections = None;

        let truncated = |offset| Error::ImageTruncated { offset };

        let dos = source.read_u16(0).ok_or(truncated(0))?;
        if dos != DOS_MAGIC {
            return Err(Error::BadImageMagic {
                offset: 0,
                found: dos as u32,
            });
        }

        let pe_offset = source.read_u32(E_LFANEW).ok_or(truncated(E_LFANEW))? as usize;
        let pe = source.read_u32(pe_offset).ok_or(truncated(pe_offset))?;
        if pe != PE_MAGIC {
            return Err(Error::BadImageMagic {
                offset: pe_offset,
                found: pe,
            });
        }

        let section_count = source.read_u16(pe_offset + 0x06).ok_or(truncated(pe_offset))?;
        let optional_size = source.read_u16(pe_offset + 0x14).ok_or(truncated(pe_offset))?;

        // Section headers follow the COFF header and the optional header.
        let mut record = pe_offset + 0x18 + optional_size as usize;

        let mut map = SectionMap::default();
        for _ in 0..section_count {
            let name_bytes = source.bytes(record, 8).ok_or(truncated(record))?;
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

            let virtual_size = source.read_u32(record + 0x08).ok_or(truncated(record))?;
            let virtual_address = source.read_u32(record + 0x0C).ok_or(truncated(record))?;

            map.insert(Section::new(
                name,
                Ibo32::new(virtual_address as i32),
                virtual_size,
            ));
            record += SECTION_HEADER_SIZE;
        }

        let count = map.section_count();
        self.sections = Some(map);
        Ok(count)
    }

    /// All sections named `name`, or `None` if nothing was parsed or the
    /// name is absent.
    pub fn sections_named(&self, name: &str) -> Option<&[Section]> {
        self.sections.as_ref()?.named(name)
    }

    /// True if `ibo` falls in any section with the given name.
    pub fn is_in_named(&self, ibo: Ibo32, name: &str) -> bool {
        self.sections_named(name)
            .is_some_and(|sections| sections_contain(sections, ibo))
    }
}
