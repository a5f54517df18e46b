//! Vtable hooking
//!
//! A hook replaces one vtable slot with a freshly generated trampoline that
//! diverts into a user callback at a chosen point of the call. Hooks on the
//! same slot stack into a chain; each link can be removed in any order and
//! the chain relinks around it.

pub mod engine;
pub mod frame;
pub mod header;
pub mod memory;
pub mod template;

pub use engine::{Hook, HookEngine};
pub use frame::{Gpr, RegisterFrame};
pub use header::{ChainLink, HookHeader};
pub use memory::{ExecutableMemory, HeapMemory};
pub use template::{Phase, RegisterSet, TrampolineKind};

#[cfg(target_os = "windows")]
pub use memory::VirtualMemory;
