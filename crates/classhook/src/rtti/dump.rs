//! Serialized scan results

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use super::RttiRecord;
use crate::error::Result;

/// A name-ordered snapshot of one scan, suitable for diffing across builds
/// of the scanned binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttiDump {
    /// Base address the scan ran against, for reading offsets back into a
    /// live debugger session.
    pub base: u64,
    pub classes: BTreeMap<String, RttiRecord>,
}

impl RttiDump {
    pub fn new(base: u64, records: HashMap<String, RttiRecord>) -> Self {
        Self {
            base,
            classes: records.into_iter().collect(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let dump = serde_json::from_str(&content)?;
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Ibo32;

    fn record(vtable: i32) -> RttiRecord {
        RttiRecord {
            vtable: Ibo32::new(vtable),
            locator: Ibo32::new(vtable + 0x100),
            type_descriptor: Ibo32::new(0x3000),
            hierarchy: Ibo32::new(0x2300),
            base_class: Ibo32::new(0x2340),
        }
    }

    #[test]
    fn test_dump_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");

        let mut records = HashMap::new();
        records.insert("gui::Widget".to_string(), record(0x2100));
        records.insert("Engine".to_string(), record(0x2500));

        let dump = RttiDump::new(0x14000_0000, records);
        dump.save(&path).unwrap();

        let loaded = RttiDump::load(&path).unwrap();
        assert_eq!(loaded, dump);
    }

    #[test]
    fn test_dump_orders_by_name() {
        let mut records = HashMap::new();
        records.insert("b::Late".to_string(), record(0x2500));
        records.insert("a::Early".to_string(), record(0x2100));

        let dump = RttiDump::new(0, records);
        let names: Vec<_> = dump.classes.keys().collect();
        assert_eq!(names, ["a::Early", "b::Late"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RttiDump::load("no-such-dump.json").unwrap_err();
        assert!(err.is_not_found());
    }
}
