//! Section ranges and the section map

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::offset::Ibo32;

/// A named virtual address range inside a mapped image.
///
/// Section names are not unique; an image can carry several sections with the
/// same name, which is why lookups return a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub size: u32,
    pub start: Ibo32,
    pub end: Ibo32,
}

impl Section {
    /// `end` is derived so that `end == start + size` always holds.
    pub fn new(name: impl Into<String>, start: Ibo32, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            start,
            end: Ibo32::new(start.get().wrapping_add(size as i32)),
        }
    }

    /// Containment over the half-open range `[start, end)`.
    pub fn contains(&self, ibo: Ibo32) -> bool {
        self.start <= ibo && ibo < self.end
    }

    pub fn contains_address(&self, address: usize, base: usize) -> bool {
        self.contains(Ibo32::from_address(address, base))
    }
}

/// True if `ibo` falls inside any section of the group.
pub fn sections_contain(sections: &[Section], ibo: Ibo32) -> bool {
    sections.iter().any(|section| section.contains(ibo))
}

/// Name → ordered section group, rebuilt wholesale on each parse.
#[derive(Debug, Default, Clone)]
pub struct SectionMap {
    sections: HashMap<String, Vec<Section>>,
}

impl SectionMap {
    /// Appends a section to its name group, preserving insertion order.
    pub fn insert(&mut self, section: Section) {
        self.sections
            .entry(section.name.clone())
            .or_default()
            .push(section);
    }

    /// All sections sharing `name`, or `None` if the name is absent.
    ///
    /// A present name always maps to a non-empty group.
    pub fn named(&self, name: &str) -> Option<&[Section]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    pub fn group_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section_count(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }
}
