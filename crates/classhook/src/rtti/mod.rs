//! RTTI class recovery
//!
//! [`RttiEngine`] rebuilds a class-name → vtable index for one mapped MSVC
//! image. Candidate vtables come from constructor instruction patterns in the
//! code sections; each candidate is then validated against the full RTTI
//! structure chain (locator, type descriptor, hierarchy descriptor, base
//! class descriptor) with section containment checked at every link, so a
//! stray instruction match cannot produce a record.

pub mod abi;
pub mod demangle;
pub mod dump;
pub mod scanner;

pub use demangle::{Demangle, TypeNameDemangler};
pub use dump::RttiDump;

#[cfg(target_os = "windows")]
pub use demangle::DbgHelpDemangler;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::image::{Ibo32, ImageMap, ImageSource, Section, sections_contain};

use abi::{BaseClassDescriptor, ClassHierarchyDescriptor, CompleteObjectLocator, TypeDescriptor};

/// One recovered class: the vtable plus the RTTI structures that proved it.
///
/// All locations are image-base-relative, so records serialized from one run
/// stay valid when the module is loaded at a different base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttiRecord {
    /// First virtual function slot of the vtable.
    pub vtable: Ibo32,
    /// Complete object locator, one pointer-size slot before the vtable.
    pub locator: Ibo32,
    pub type_descriptor: Ibo32,
    pub hierarchy: Ibo32,
    pub base_class: Ibo32,
}

/// Recovered class index for one image.
#[derive(Debug, Default)]
pub struct RttiEngine {
    config: ScanConfig,
    base: Option<usize>,
    records: HashMap<String, RttiRecord>,
}

impl RttiEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Rebuild the class index from the image.
    ///
    /// Returns `false` when the configured sections are absent; candidate
    /// vtables that fail structure validation are skipped silently.
    pub fn scan<S: ImageSource, D: Demangle>(
        &mut self,
        map: &ImageMap,
        source: &S,
        demangler: &D,
    ) -> bool {
        match self.scan_checked(map, source, demangler) {
            Ok(count) => {
                debug!(classes = count, "rtti scan complete");
                true
            }
            Err(e) => {
                warn!("rtti scan failed: {e}");
                false
            }
        }
    }

    /// [`RttiEngine::scan`] with the concrete failure reason.
    pub fn scan_checked<S: ImageSource, D: Demangle>(
        &mut self,
        map: &ImageMap,
        source: &S,
        demangler: &D,
    ) -> Result<usize> {
        let missing = |name: &str| Error::MissingSection(name.to_string());

        let code = map
            .sections_named(&self.config.code_section)
            .ok_or_else(|| missing(&self.config.code_section))?;
        let rdata = map
            .sections_named(&self.config.rdata_section)
            .ok_or_else(|| missing(&self.config.rdata_section))?;
        let data = map
            .sections_named(&self.config.data_section)
            .ok_or_else(|| missing(&self.config.data_section))?;

        self.records.clear();
        self.base = Some(source.base());

        for section in code {
            let Some(start) = section.start.as_offset() else {
                continue;
            };
            let len = section.size as usize;
            let Some(bytes) = source.bytes(start, len.min(source.size().saturating_sub(start)))
            else {
                continue;
            };

            for hit in scanner::scan_constructors(bytes, section.start) {
                let Some((name, record)) =
                    self.resolve_candidate(source, demangler, rdata, data, hit.vtable)
                else {
                    continue;
                };
                self.records
                    .entry(name)
                    .and_modify(|existing| {
                        if existing.vtable != record.vtable {
                            trace!(vtable = %record.vtable, kept = %existing.vtable, "duplicate class name, keeping first");
                        }
                    })
                    .or_insert(record);
            }
        }

        Ok(self.records.len())
    }

    /// Validate one candidate vtable against the RTTI structure chain.
    fn resolve_candidate<S: ImageSource, D: Demangle>(
        &self,
        source: &S,
        demangler: &D,
        rdata: &[Section],
        data: &[Section],
        vtable: Ibo32,
    ) -> Option<(String, RttiRecord)> {
        if !sections_contain(rdata, vtable) {
            return None;
        }

        // The slot directly before the vtable holds an absolute pointer to
        // the complete object locator.
        let col_slot = Ibo32::new(vtable.get().checked_sub(8)?);
        if !sections_contain(rdata, col_slot) {
            return None;
        }
        let locator_address = source.read_usize(col_slot.as_offset()?)?;
        let locator = Ibo32::from_address(locator_address, source.base());
        if locator.to_address(source.base()) != locator_address {
            // Pointer does not live within 2 GiB of the base; not ours.
            return None;
        }
        if !sections_contain(rdata, locator) {
            return None;
        }

        let col = CompleteObjectLocator::read(source, locator)?;
        if col.signature != CompleteObjectLocator::SIGNATURE_64 {
            return None;
        }
        if !sections_contain(data, col.type_descriptor) {
            return None;
        }
        if !sections_contain(rdata, col.class_descriptor) {
            return None;
        }

        let hierarchy = ClassHierarchyDescriptor::read(source, col.class_descriptor)?;
        if !sections_contain(rdata, hierarchy.base_class_descriptor) {
            return None;
        }
        // Structural read only; the base class graph is not walked further.
        BaseClassDescriptor::read(source, hierarchy.base_class_descriptor)?;

        let mangled =
            TypeDescriptor::read_name(source, col.type_descriptor, self.config.max_name_len)?;
        let name = demangler.demangle(&mangled).ok()?;

        Some((
            name,
            RttiRecord {
                vtable,
                locator,
                type_descriptor: col.type_descriptor,
                hierarchy: col.class_descriptor,
                base_class: hierarchy.base_class_descriptor,
            },
        ))
    }

    pub fn get(&self, name: &str) -> Option<&RttiRecord> {
        self.records.get(name)
    }

    /// [`RttiEngine::get`] with a [`Error::ClassNotFound`] failure.
    pub fn lookup(&self, name: &str) -> Result<&RttiRecord> {
        self.records
            .get(name)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    /// Absolute address of the class's vtable in the scanned image.
    pub fn vtable_address(&self, name: &str) -> Option<usize> {
        Some(self.get(name)?.vtable.to_address(self.base?))
    }

    /// Base address the records were recovered against.
    pub fn base(&self) -> Option<usize> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &RttiRecord)> {
        self.records.iter().map(|(name, r)| (name.as_str(), r))
    }

    /// Snapshot the index in a serializable, name-ordered form.
    pub fn dump(&self) -> RttiDump {
        RttiDump::new(self.base.unwrap_or(0) as u64, self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::OwnedImage;

    const TEXT: i32 = 0x1000;
    const RDATA: i32 = 0x2000;
    const DATA: i32 = 0x3000;

    /// A minimal image with one polymorphic class `gui::Widget`: constructor
    /// pattern in .text, vtable + RTTI structures in .rdata, type descriptor
    /// in .data.
    fn widget_image() -> OwnedImage {
        let mut image = OwnedImage::new(vec![0u8; 0x4000]);

        image.patch(0, &0x5A4Du16.to_le_bytes());
        image.patch(0x3C, &0x80u32.to_le_bytes());
        image.patch(0x80, &0x4550u32.to_le_bytes());
        image.patch(0x86, &3u16.to_le_bytes());
        image.patch(0x94, &0xF0u16.to_le_bytes());

        let headers = 0x80 + 0x18 + 0xF0;
        for (i, (name, start)) in [(".text", TEXT), (".rdata", RDATA), (".data", DATA)]
            .iter()
            .enumerate()
        {
            let record = headers + i * 0x28;
            image.patch(record, name.as_bytes());
            image.patch(record + 0x08, &0x1000u32.to_le_bytes());
            image.patch(record + 0x0C, &(*start as u32).to_le_bytes());
        }

        write_class(&mut image, 0x1100, 0x2100, 0x2200, 0x3040, b".?AVWidget@gui@@\0");
        image
    }

    /// Emit a constructor pattern plus the full RTTI chain for one class.
    fn write_class(
        image: &mut OwnedImage,
        pattern: i32,
        vtable: i32,
        locator: i32,
        descriptor: i32,
        mangled: &[u8],
    ) {
        // lea rax,[rip+disp]; mov [rcx],rax
        let disp = vtable - (pattern + 7);
        image.patch(pattern as usize, &[0x48, 0x8D, 0x05]);
        image.patch(pattern as usize + 3, &disp.to_le_bytes());
        image.patch(pattern as usize + 7, &[0x48, 0x89, 0x01, 0x90]);

        let base = image.base();
        image.patch_usize(vtable as usize - 8, base + locator as usize);

        let hierarchy = locator + 0x100;
        image.patch(locator as usize, &1u32.to_le_bytes());
        image.patch(locator as usize + 0x0C, &descriptor.to_le_bytes());
        image.patch(locator as usize + 0x10, &hierarchy.to_le_bytes());
        image.patch(hierarchy as usize + 0x0C, &(hierarchy + 0x40).to_le_bytes());

        image.patch(descriptor as usize + 0x10, mangled);
    }

    fn parsed_map(image: &OwnedImage) -> ImageMap {
        let mut map = ImageMap::new();
        assert!(map.parse(image));
        map
    }

    #[test]
    fn test_scan_recovers_class() {
        let image = widget_image();
        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();

        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert_eq!(engine.len(), 1);

        let record = engine.get("gui::Widget").unwrap();
        assert_eq!(record.vtable, Ibo32::new(0x2100));
        assert_eq!(record.locator, Ibo32::new(0x2200));
        assert_eq!(record.type_descriptor, Ibo32::new(0x3040));
        assert_eq!(
            engine.vtable_address("gui::Widget").unwrap(),
            image.base() + 0x2100
        );
    }

    #[test]
    fn test_scan_missing_section_fails() {
        let image = widget_image();
        let map = parsed_map(&image);

        let mut config = ScanConfig::default();
        config.code_section = ".code".to_string();
        let mut engine = RttiEngine::with_config(config);

        assert!(!engine.scan(&map, &image, &TypeNameDemangler));
        assert!(matches!(
            engine.scan_checked(&map, &image, &TypeNameDemangler),
            Err(Error::MissingSection(name)) if name == ".code"
        ));
    }

    #[test]
    fn test_scan_rejects_bad_locator_signature() {
        let mut image = widget_image();
        image.patch(0x2200, &0u32.to_le_bytes());

        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();
        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_scan_rejects_locator_outside_rdata() {
        let mut image = widget_image();
        let base = image.base();
        image.patch_usize(0x2100 - 8, base + 0x3100);

        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();
        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_scan_rejects_descriptor_outside_data() {
        let mut image = widget_image();
        // Point the type descriptor into .rdata instead of .data.
        image.patch(0x220C, &0x2400u32.to_le_bytes());

        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();
        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let mut image = widget_image();
        // Second constructor pattern referencing the same class name through
        // a separate vtable and structure chain.
        write_class(&mut image, 0x1200, 0x2500, 0x2600, 0x3140, b".?AVWidget@gui@@\0");

        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();
        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get("gui::Widget").unwrap().vtable, Ibo32::new(0x2100));
    }

    #[test]
    fn test_rescan_is_deterministic() {
        let image = widget_image();
        let map = parsed_map(&image);
        let mut engine = RttiEngine::new();

        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        let first = *engine.get("gui::Widget").unwrap();
        assert!(engine.scan(&map, &image, &TypeNameDemangler));
        assert_eq!(*engine.get("gui::Widget").unwrap(), first);
    }

    #[test]
    fn test_lookup_unknown_class() {
        let engine = RttiEngine::new();
        assert!(engine.get("app::Missing").is_none());
        assert!(matches!(
            engine.lookup("app::Missing"),
            Err(Error::ClassNotFound(name)) if name == "app::Missing"
        ));
    }
}
