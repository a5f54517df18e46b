//! Hook installation and removal
//!
//! Chains on the same vtable slot are serialized through a per-slot lock
//! held across classification, chain surgery and the slot write, so
//! concurrent installs and removals always observe a consistent chain. The
//! lock registry is process-wide: hook blocks are recognized crate-wide by
//! their magic tag, so hooks from separate engines splice into one chain and
//! must serialize on the same lock. Each installed hook keeps a raw clone of
//! its slot lock in the header, which pins the lock for as long as any hook
//! on that slot is alive.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rtti::RttiEngine;

use super::frame::RegisterFrame;
use super::header::{ChainLink, HookHeader};
use super::memory::ExecutableMemory;
use super::template::{self, TrampolineKind};

#[cfg(target_os = "windows")]
use super::memory::VirtualMemory;

#[cfg(not(target_os = "windows"))]
use super::memory::HeapMemory;

/// Slot locks keyed by slot address, shared by every engine in the process.
///
/// Slots are process-global resources and chain membership is decided by the
/// crate-wide magic tag, not by which engine allocated a block; a lock owned
/// by one engine could not serialize another engine's surgery on the same
/// chain.
fn slot_locks() -> &'static Mutex<HashMap<usize, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<usize, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(Default::default)
}

/// The chain lock for one slot address, created on first use.
fn chain_lock(slot: usize) -> Arc<Mutex<()>> {
    let mut locks = slot_locks().lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(slot).or_default().clone()
}

/// Hand back a clone taken via [`chain_lock`], pruning the registry entry
/// once nothing else holds the lock. Clones are only handed out under the
/// map mutex, so a strong count of one here cannot race an acquisition.
fn release_chain_lock(slot: usize, lock: Arc<Mutex<()>>) {
    let mut locks = slot_locks().lock().unwrap_or_else(PoisonError::into_inner);
    drop(lock);
    if locks.get(&slot).is_some_and(|l| Arc::strong_count(l) == 1) {
        locks.remove(&slot);
    }
}

/// State shared between the engine and every hook it has produced.
struct EngineShared {
    memory: Box<dyn ExecutableMemory>,
}

impl EngineShared {
    /// Write one pointer through a temporarily unprotected page.
    unsafe fn protected_write(&self, address: usize, value: usize) -> Result<()> {
        let len = std::mem::size_of::<usize>();
        // SAFETY: caller guarantees the slot is mapped.
        let token = unsafe { self.memory.unprotect(address, len) }?;
        fence(Ordering::SeqCst);
        // SAFETY: the page is writable until reprotect below.
        unsafe { (address as *mut usize).write_volatile(value) };
        unsafe { self.memory.reprotect(address, len, token) }?;
        Ok(())
    }
}

/// Write one header field with the store visible before any later slot
/// write. Header pages are always writable; no protection dance needed.
unsafe fn fenced_write<T>(target: *mut T, value: T) {
    fence(Ordering::SeqCst);
    // SAFETY: caller guarantees target is valid and in a writable block.
    unsafe { target.write_volatile(value) };
}

/// Installs vtable hooks and hands out owning [`Hook`] handles.
///
/// Cloning is cheap and clones share the allocator. Slot locks live in the
/// process-wide registry, so even separate engines hooking the same slot
/// serialize correctly.
#[derive(Clone)]
pub struct HookEngine {
    shared: Arc<EngineShared>,
}

impl HookEngine {
    pub fn new() -> Self {
        #[cfg(target_os = "windows")]
        return Self::with_memory(Box::new(VirtualMemory));
        #[cfg(not(target_os = "windows"))]
        return Self::with_memory(Box::new(HeapMemory));
    }

    pub fn with_memory(memory: Box<dyn ExecutableMemory>) -> Self {
        Self {
            shared: Arc::new(EngineShared { memory }),
        }
    }

    /// Hook one virtual function of a recovered class.
    ///
    /// Failures (unknown class, allocation, protection) are logged and
    /// produce an inert handle rather than an error, so callers can install
    /// a batch of hooks and keep whatever stuck.
    ///
    /// # Safety
    ///
    /// `classes` must describe the live image of this process and `callback`
    /// must be a function matching the calling convention the chosen
    /// trampoline kind diverts into.
    pub unsafe fn install_by_class(
        &self,
        classes: &RttiEngine,
        class: &str,
        index: usize,
        kind: TrampolineKind,
        callback: *const u8,
    ) -> Hook {
        let Some(vtable) = classes.vtable_address(class) else {
            debug!(class, "class not in index, hook left inert");
            return self.inert();
        };
        // SAFETY: the vtable came out of the live image scan.
        match unsafe { self.install_by_vtable(vtable, index, kind, callback) } {
            Ok(hook) => hook,
            Err(e) => {
                warn!(class, index, "hook install failed: {e}");
                self.inert()
            }
        }
    }

    /// Hook one slot of a vtable given its raw address.
    ///
    /// # Safety
    ///
    /// Same contract as [`HookEngine::install_at`] for the slot at
    /// `vtable + index * 8`.
    pub unsafe fn install_by_vtable(
        &self,
        vtable: usize,
        index: usize,
        kind: TrampolineKind,
        callback: *const u8,
    ) -> Result<Hook> {
        let slot = vtable + index * std::mem::size_of::<usize>();
        // SAFETY: forwarded caller contract.
        unsafe { self.install_at(slot, kind, callback) }
    }

    /// Hook the function pointer stored at `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must address a live function pointer. Any non-null pointer
    /// already stored there must have [`HookHeader::SIZE`] readable bytes
    /// before its target, which holds for functions inside a mapped image.
    pub unsafe fn install_at(
        &self,
        slot: usize,
        kind: TrampolineKind,
        callback: *const u8,
    ) -> Result<Hook> {
        let lock = chain_lock(slot);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: caller guarantees the slot is readable.
        let current = unsafe { (slot as *const *const u8).read_volatile() };

        let code = template::generate(kind);
        let size = HookHeader::SIZE + code.len();
        let Some(block) = self.shared.memory.alloc(size) else {
            drop(guard);
            release_chain_lock(slot, lock);
            return Err(Error::AllocationFailed(size));
        };

        let frame = Box::into_raw(Box::new(RegisterFrame::default()));
        let header = block.as_ptr() as *mut HookHeader;
        // SAFETY: the block is fresh, writable and large enough.
        unsafe {
            header.write(HookHeader {
                magic: HookHeader::MAGIC,
                lock: Arc::into_raw(Arc::clone(&lock)),
                frame,
                previous: slot as *mut u8,
                fn_new: callback,
                fn_hooked: current,
                extra: std::ptr::null_mut(),
            });
            std::ptr::copy_nonoverlapping(
                code.as_ptr(),
                block.as_ptr().add(HookHeader::SIZE),
                code.len(),
            );
        }

        // A hook already at the top of the chain now has this block between
        // it and the slot.
        // SAFETY: caller guarantees probe bytes before `current` exist.
        let below = unsafe { ChainLink::from_code_ptr(current) };
        if let ChainLink::Hook(next) = below {
            // SAFETY: next is a live hook block of ours.
            unsafe { fenced_write(&raw mut (*next).previous, block.as_ptr()) };
        }

        let entry = unsafe { block.as_ptr().add(HookHeader::SIZE) } as usize;
        // SAFETY: caller guarantees the slot is a mapped pointer location.
        if let Err(e) = unsafe { self.shared.protected_write(slot, entry) } {
            // Roll back so the chain never references the dead block.
            if let ChainLink::Hook(next) = below {
                // SAFETY: same live block as above.
                unsafe { fenced_write(&raw mut (*next).previous, slot as *mut u8) };
            }
            // SAFETY: nothing references the block after the rollback.
            unsafe {
                drop(Arc::from_raw((*header).lock));
                drop(Box::from_raw(frame));
                self.shared.memory.free(block, size);
            }
            drop(guard);
            release_chain_lock(slot, lock);
            return Err(e);
        }

        debug!(slot = format_args!("{slot:#x}"), %kind, "hook installed");
        drop(guard);

        Ok(Hook {
            shared: Arc::clone(&self.shared),
            state: Some(HookState { block, size, slot }),
        })
    }

    /// A handle that owns nothing and removes nothing.
    fn inert(&self) -> Hook {
        Hook {
            shared: Arc::clone(&self.shared),
            state: None,
        }
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct HookState {
    block: NonNull<u8>,
    size: usize,
    slot: usize,
}

/// An owning handle for one installed hook; dropping it unhooks.
pub struct Hook {
    shared: Arc<EngineShared>,
    state: Option<HookState>,
}

// The raw block pointer is owned by exactly this handle and all shared
// chain state is lock-protected.
unsafe impl Send for Hook {}

impl Hook {
    pub fn is_installed(&self) -> bool {
        self.state.is_some()
    }

    /// Entry address of this hook's trampoline, while installed.
    pub fn code_address(&self) -> Option<usize> {
        self.state
            .as_ref()
            .map(|s| s.block.as_ptr() as usize + HookHeader::SIZE)
    }

    /// Unlink from the chain and release the block. Idempotent; also runs
    /// on drop.
    pub fn remove(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        let lock = chain_lock(state.slot);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let header = state.block.as_ptr() as *mut HookHeader;
        // SAFETY: the block stays alive until the free below.
        let displaced = unsafe { (&raw const (*header).fn_hooked).read() };
        let previous = unsafe { (&raw const (*header).previous).read() };

        // The hook below this one, if any, is now pointed at by whatever
        // pointed at this one.
        // SAFETY: displaced satisfies the probe contract from install time.
        if let ChainLink::Hook(next) = unsafe { ChainLink::from_code_ptr(displaced) } {
            // SAFETY: next is a live hook block under the same slot lock.
            unsafe { fenced_write(&raw mut (*next).previous, previous) };
        }

        // Repoint the upstream reference past this hook.
        // SAFETY: previous is either a hook header or the slot address.
        let unlinked = match unsafe { ChainLink::from_header_ptr(previous) } {
            ChainLink::Hook(prev) => {
                // SAFETY: prev is a live hook block under the same slot lock.
                unsafe { fenced_write(&raw mut (*prev).fn_hooked, displaced) };
                true
            }
            ChainLink::Foreign(_) => {
                // SAFETY: the slot was mapped at install time.
                match unsafe { self.shared.protected_write(state.slot, displaced as usize) } {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("hook removal slot write failed: {e}");
                        false
                    }
                }
            }
        };

        drop(guard);

        if !unlinked {
            // The slot may still point into the block; leak it rather than
            // hand out its pages for reuse. The header's pinned lock clone
            // keeps the registry entry alive with it.
            return;
        }

        debug!(slot = format_args!("{:#x}", state.slot), "hook removed");
        // SAFETY: the chain no longer references this block and the handle
        // is the sole owner of frame and lock clones.
        unsafe {
            drop(Arc::from_raw((*header).lock));
            drop(Box::from_raw((*header).frame));
            self.shared.memory.free(state.block, state.size);
        }
        release_chain_lock(state.slot, lock);
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::memory::HeapMemory;
    use crate::hook::template::{Phase, RegisterSet};

    const KIND: TrampolineKind = TrampolineKind::new(Phase::Entry, RegisterSet::Integer);

    fn engine() -> HookEngine {
        HookEngine::with_memory(Box::new(HeapMemory))
    }

    /// A stand-in function body with readable bytes before it, like any
    /// function inside a mapped image.
    fn fake_function() -> (Vec<u8>, *const u8) {
        let body = vec![0u8; 0x100];
        let entry = unsafe { body.as_ptr().add(0x80) };
        (body, entry)
    }

    unsafe fn header_of(code: usize) -> *mut HookHeader {
        match unsafe { ChainLink::from_code_ptr(code as *const u8) } {
            ChainLink::Hook(header) => header,
            ChainLink::Foreign(p) => panic!("expected hook code pointer, got foreign {p:?}"),
        }
    }

    #[test]
    fn test_install_and_remove_restores_slot() {
        let engine = engine();
        let (_body, original) = fake_function();
        let mut slot: *const u8 = original;
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let hook = unsafe { engine.install_at(slot_addr, KIND, 0x1234 as *const u8) }.unwrap();
        assert!(hook.is_installed());
        assert_eq!(slot as usize, hook.code_address().unwrap());

        let header = unsafe { header_of(slot as usize) };
        unsafe {
            assert_eq!((*header).fn_hooked, original);
            assert_eq!((*header).previous as usize, slot_addr);
            assert_eq!((*header).fn_new as usize, 0x1234);
            assert!(!(*header).frame.is_null());
        }

        drop(hook);
        assert_eq!(slot, original);
    }

    #[test]
    fn test_chain_removal_out_of_order() {
        let engine = engine();
        let (_body, original) = fake_function();
        let mut slot: *const u8 = original;
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let callback = 0x1000 as *const u8;
        let h1 = unsafe { engine.install_at(slot_addr, KIND, callback) }.unwrap();
        let mut h2 = unsafe { engine.install_at(slot_addr, KIND, callback) }.unwrap();
        let h3 = unsafe { engine.install_at(slot_addr, KIND, callback) }.unwrap();

        assert_eq!(slot as usize, h3.code_address().unwrap());

        // Middle removal: h3 must now continue into h1.
        h2.remove();
        assert!(!h2.is_installed());
        let top = unsafe { header_of(slot as usize) };
        unsafe {
            assert_eq!((*top).fn_hooked as usize, h1.code_address().unwrap());
        }
        let below = unsafe { header_of(h1.code_address().unwrap()) };
        unsafe {
            assert_eq!((*below).previous as usize, top as usize);
        }

        // Top removal: slot falls back to h1.
        drop(h3);
        assert_eq!(slot as usize, h1.code_address().unwrap());

        drop(h1);
        assert_eq!(slot, original);
    }

    #[test]
    fn test_two_engines_splice_into_one_chain() {
        let first = engine();
        let second = engine();
        let (_body, original) = fake_function();
        let mut slot: *const u8 = original;
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let ha = unsafe { first.install_at(slot_addr, KIND, 0x1000 as *const u8) }.unwrap();
        let hb = unsafe { second.install_at(slot_addr, KIND, 0x2000 as *const u8) }.unwrap();

        // The second engine's hook chained onto the first engine's.
        assert_eq!(slot as usize, hb.code_address().unwrap());
        let top = unsafe { header_of(slot as usize) };
        unsafe {
            assert_eq!((*top).fn_hooked as usize, ha.code_address().unwrap());
        }

        // Removing the first engine's hook relinks around it even though it
        // sits below a hook it did not install.
        drop(ha);
        let top = unsafe { header_of(slot as usize) };
        unsafe {
            assert_eq!((*top).fn_hooked, original);
            assert_eq!((*top).previous as usize, slot_addr);
        }

        drop(hb);
        assert_eq!(slot, original);
    }

    #[test]
    fn test_slot_lock_entry_pruned_after_last_removal() {
        let engine = engine();
        let (_body, original) = fake_function();
        let mut slot: *const u8 = original;
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let contains = |slot: usize| {
            slot_locks()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&slot)
        };

        let h1 = unsafe { engine.install_at(slot_addr, KIND, 0x1000 as *const u8) }.unwrap();
        let mut h2 = unsafe { engine.install_at(slot_addr, KIND, 0x1000 as *const u8) }.unwrap();
        assert!(contains(slot_addr));

        h2.remove();
        assert!(contains(slot_addr), "entry pruned while a hook remains");

        drop(h1);
        assert!(!contains(slot_addr), "entry not pruned after last removal");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let engine = engine();
        let (_body, original) = fake_function();
        let mut slot: *const u8 = original;
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let mut hook = unsafe { engine.install_at(slot_addr, KIND, 0x1000 as *const u8) }.unwrap();
        hook.remove();
        hook.remove();
        assert_eq!(slot, original);
        assert!(hook.code_address().is_none());
    }

    #[test]
    fn test_unknown_class_is_inert() {
        let engine = engine();
        let classes = RttiEngine::new();
        let hook = unsafe {
            engine.install_by_class(&classes, "app::Missing", 0, KIND, 0x1000 as *const u8)
        };
        assert!(!hook.is_installed());
        assert!(hook.code_address().is_none());
    }

    #[test]
    fn test_hooking_a_null_slot_chains_nothing() {
        let engine = engine();
        let mut slot: *const u8 = std::ptr::null();
        let slot_addr = &mut slot as *mut *const u8 as usize;

        let hook = unsafe { engine.install_at(slot_addr, KIND, 0x1000 as *const u8) }.unwrap();
        let header = unsafe { header_of(slot as usize) };
        unsafe {
            assert!((*header).fn_hooked.is_null());
        }
        drop(hook);
        assert!(slot.is_null());
    }
}
