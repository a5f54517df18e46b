//! Executable memory and page protection
//!
//! Hook blocks need executable backing and vtable slots sit in read-only
//! pages, so both concerns go through [`ExecutableMemory`]. The Windows
//! implementation wraps the virtual memory API; [`HeapMemory`] backs
//! structural tests on any platform where nothing is ever executed.

use std::ptr::NonNull;

use crate::error::Result;

/// Allocator for hook blocks plus page protection control.
pub trait ExecutableMemory: Send + Sync {
    /// Allocate `size` executable bytes, or `None` when the OS refuses.
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block from [`ExecutableMemory::alloc`].
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator with the same `size` and no
    /// thread may execute or touch the block afterwards.
    unsafe fn free(&self, block: NonNull<u8>, size: usize);

    /// Make `address..address + len` writable, returning a token for
    /// [`ExecutableMemory::reprotect`].
    ///
    /// # Safety
    ///
    /// The range must be mapped in the current process.
    unsafe fn unprotect(&self, address: usize, len: usize) -> Result<u32>;

    /// Restore the protection captured by [`ExecutableMemory::unprotect`].
    ///
    /// # Safety
    ///
    /// `token` must come from an `unprotect` call over the same range.
    unsafe fn reprotect(&self, address: usize, len: usize, token: u32) -> Result<()>;
}

/// Virtual-memory-backed implementation used in the target process.
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualMemory;

#[cfg(target_os = "windows")]
impl ExecutableMemory for VirtualMemory {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        use windows::Win32::System::Memory::{
            MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc,
        };

        // SAFETY: a fresh commit of unshared pages.
        let block = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        };
        NonNull::new(block.cast())
    }

    unsafe fn free(&self, block: NonNull<u8>, _size: usize) {
        use windows::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

        // SAFETY: caller guarantees the block came from alloc and is idle.
        // Releasing a whole reservation takes size zero.
        if let Err(e) = unsafe { VirtualFree(block.as_ptr().cast(), 0, MEM_RELEASE) } {
            tracing::warn!("executable block release failed: {e}");
        }
    }

    unsafe fn unprotect(&self, address: usize, len: usize) -> Result<u32> {
        use windows::Win32::System::Memory::{
            PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
        };

        use crate::error::Error;

        let mut previous = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: caller guarantees the range is mapped.
        unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                len,
                PAGE_EXECUTE_READWRITE,
                &mut previous,
            )
        }
        .map_err(|e| Error::ProtectionFailed {
            address,
            message: e.to_string(),
        })?;
        Ok(previous.0)
    }

    unsafe fn reprotect(&self, address: usize, len: usize, token: u32) -> Result<()> {
        use windows::Win32::System::Memory::{PAGE_PROTECTION_FLAGS, VirtualProtect};

        use crate::error::Error;

        let mut previous = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: caller guarantees the range is mapped.
        unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                len,
                PAGE_PROTECTION_FLAGS(token),
                &mut previous,
            )
        }
        .map_err(|e| Error::ProtectionFailed {
            address,
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Plain heap allocation with no-op protection control.
///
/// Blocks are writable and readable but not executable; good enough for
/// exercising install and removal bookkeeping off the target platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapMemory;

impl HeapMemory {
    const ALIGN: usize = 16;
}

impl ExecutableMemory for HeapMemory {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(size, Self::ALIGN).ok()?;
        // SAFETY: layout has non-zero size for any real hook block.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn free(&self, block: NonNull<u8>, size: usize) {
        let Ok(layout) = std::alloc::Layout::from_size_align(size, Self::ALIGN) else {
            return;
        };
        // SAFETY: caller guarantees block and size match the allocation.
        unsafe { std::alloc::dealloc(block.as_ptr(), layout) };
    }

    unsafe fn unprotect(&self, _address: usize, _len: usize) -> Result<u32> {
        Ok(0)
    }

    unsafe fn reprotect(&self, _address: usize, _len: usize, _token: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alloc_is_aligned_and_zeroed() {
        let memory = HeapMemory;
        let block = memory.alloc(0x100).unwrap();
        assert_eq!(block.as_ptr() as usize % HeapMemory::ALIGN, 0);

        // SAFETY: freshly allocated, exclusively owned.
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 0x100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { memory.free(block, 0x100) };
    }

    #[test]
    fn test_heap_protection_is_noop() {
        let memory = HeapMemory;
        let token = unsafe { memory.unprotect(0x1000, 8) }.unwrap();
        unsafe { memory.reprotect(0x1000, 8, token) }.unwrap();
    }
}
