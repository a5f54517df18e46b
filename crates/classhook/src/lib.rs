//! # classhook
//!
//! RTTI-driven vtable hooking for 64-bit MSVC binaries, from inside the
//! target process.
//!
//! This crate provides:
//! - PE section mapping over an already-loaded image
//! - RTTI class recovery by scanning constructor instruction patterns
//! - Chained vtable hooks built from generated trampolines
//! - JSON export of recovered class layouts
//!
//! The usual flow is [`ImageMap`] → [`RttiEngine::scan`] →
//! [`HookEngine::install_by_class`]; hooks unhook themselves on drop.

pub mod config;
pub mod error;
pub mod hook;
pub mod image;
pub mod rtti;

pub use config::{ScanConfig, load_config, save_config};
pub use error::{Error, Result};
pub use hook::{
    ChainLink, ExecutableMemory, Gpr, HeapMemory, Hook, HookEngine, HookHeader, Phase,
    RegisterFrame, RegisterSet, TrampolineKind,
};
pub use image::{
    Ibo32, ImageMap, ImageSource, LiveImage, ModuleInfo, OwnedImage, Section, SectionMap,
};
pub use rtti::{Demangle, RttiDump, RttiEngine, RttiRecord, TypeNameDemangler};

#[cfg(target_os = "windows")]
pub use hook::VirtualMemory;

#[cfg(target_os = "windows")]
pub use rtti::DbgHelpDemangler;
