//! Hook block header and chain classification
//!
//! Every hook allocation starts with a [`HookHeader`] and places generated
//! code immediately after it, so any code pointer produced by this crate has
//! a recognizable header [`HookHeader::SIZE`] bytes before it. Chain walking
//! classifies arbitrary pointers by probing for the magic value: a match
//! means one of ours, anything else is foreign (the original vtable entry or
//! another tool's detour).

use std::sync::Mutex;

use super::frame::RegisterFrame;

/// Metadata block preceding each trampoline's code.
///
/// Field offsets are load-bearing: generated code addresses `frame`,
/// `fn_new`, `fn_hooked` and `extra` rip-relatively by constant displacement.
#[derive(Debug)]
#[repr(C)]
pub struct HookHeader {
    pub magic: u64,
    /// Raw clone of the per-slot chain lock, kept so the lock outlives the
    /// engine while this hook is installed.
    pub lock: *const Mutex<()>,
    pub frame: *mut RegisterFrame,
    /// Code pointer this hook displaced: the vtable slot address when this
    /// hook is bottom of the chain, otherwise the next hook's header.
    pub previous: *mut u8,
    /// User callback the trampolines divert into.
    pub fn_new: *const u8,
    /// Continuation target: the displaced function, or the next hook's code.
    pub fn_hooked: *const u8,
    /// Scratch slot generated code uses to stash a return address.
    pub extra: *mut u8,
}

impl HookHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Identifies hook blocks written by this crate.
    pub const MAGIC: u64 = u64::from_le_bytes(*b"classhk\0");

    pub const FRAME_OFFSET: usize = 0x10;
    pub const FN_NEW_OFFSET: usize = 0x20;
    pub const FN_HOOKED_OFFSET: usize = 0x28;
    pub const EXTRA_OFFSET: usize = 0x30;
}

/// One link of a hook chain, as read out of a vtable slot or a header's
/// `previous`/`fn_hooked` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    /// A hook block owned by this crate.
    Hook(*mut HookHeader),
    /// Any other pointer, including null and unhooked function entries.
    Foreign(*mut u8),
}

impl ChainLink {
    /// Classify a code pointer by probing for a header before it.
    ///
    /// # Safety
    ///
    /// A non-null `code` must have at least [`HookHeader::SIZE`] readable
    /// bytes before it. Function pointers taken out of vtables satisfy this
    /// in practice since functions never start at the front of a mapping.
    pub unsafe fn from_code_ptr(code: *const u8) -> Self {
        if code.is_null() {
            return ChainLink::Foreign(std::ptr::null_mut());
        }
        // SAFETY: caller guarantees the bytes before `code` are readable.
        let candidate = unsafe { code.sub(HookHeader::SIZE) } as *mut HookHeader;
        // SAFETY: probing readable memory that may not hold a header.
        let magic = unsafe { (&raw const (*candidate).magic).read_unaligned() };
        if magic == HookHeader::MAGIC {
            ChainLink::Hook(candidate)
        } else {
            ChainLink::Foreign(code as *mut u8)
        }
    }

    /// Classify a pointer that, if ours, addresses a header directly.
    ///
    /// # Safety
    ///
    /// A non-null `pointer` must have at least the magic field's 8 bytes
    /// readable at it.
    pub unsafe fn from_header_ptr(pointer: *mut u8) -> Self {
        if pointer.is_null() {
            return ChainLink::Foreign(std::ptr::null_mut());
        }
        let candidate = pointer as *mut HookHeader;
        // SAFETY: probing readable memory that may not hold a header.
        let magic = unsafe { (&raw const (*candidate).magic).read_unaligned() };
        if magic == HookHeader::MAGIC {
            ChainLink::Hook(candidate)
        } else {
            ChainLink::Foreign(pointer)
        }
    }
}
