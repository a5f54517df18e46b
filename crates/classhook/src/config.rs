//! Scan configuration
//!
//! Section names are not guaranteed across toolchains or packers, so the
//! sections the RTTI scanner considers code, initialized data and read-only
//! data are configurable and can be persisted alongside other tooling state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanConfig {
    /// Section group scanned for constructor instruction patterns.
    pub code_section: String,
    /// Section group that must contain type descriptors.
    pub data_section: String,
    /// Section group that must contain vtables and RTTI locator structures.
    pub rdata_section: String,
    /// Upper bound on a mangled type name read out of a type descriptor.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

fn default_max_name_len() -> usize {
    256
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            code_section: ".text".to_string(),
            data_section: ".data".to_string(),
            rdata_section: ".rdata".to_string(),
            max_name_len: default_max_name_len(),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ScanConfig> {
    let content = fs::read_to_string(&path)?;
    let config = serde_json::from_str(&content)?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(path: P, config: &ScanConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
