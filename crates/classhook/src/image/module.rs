//! Process module information

use tracing::warn;

/// Handles and bounds of one mapped module.
///
/// Handles are stored as raw integers so the type stays constructible on any
/// target; only [`ModuleInfo::current_process`] talks to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub process: isize,
    pub module: isize,
    pub base: usize,
    pub size: usize,
}

impl ModuleInfo {
    /// Module info for a caller-supplied mapping, e.g. a synthetic image or a
    /// foreign target whose bounds were obtained elsewhere.
    pub fn from_parts(base: usize, size: usize) -> Self {
        Self {
            process: 0,
            module: 0,
            base,
            size,
        }
    }

    /// Query the OS for the current process's main module.
    ///
    /// Returns `None` when the module information query fails.
    #[cfg(target_os = "windows")]
    pub fn current_process() -> Option<Self> {
        use windows::Win32::System::LibraryLoader::GetModuleHandleA;
        use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
        use windows::Win32::System::Threading::GetCurrentProcess;
        use windows::core::PCSTR;

        // SAFETY: querying handles and module bounds of our own process.
        unsafe {
            let process = GetCurrentProcess();
            let module = match GetModuleHandleA(PCSTR::null()) {
                Ok(module) => module,
                Err(e) => {
                    warn!("GetModuleHandle failed: {e}");
                    return None;
                }
            };

            let mut info = MODULEINFO::default();
            if let Err(e) = GetModuleInformation(
                process,
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            ) {
                warn!("GetModuleInformation failed: {e}");
                return None;
            }

            Some(Self {
                process: process.0 as isize,
                module: module.0 as isize,
                base: info.lpBaseOfDll as usize,
                size: info.SizeOfImage as usize,
            })
        }
    }

    #[cfg(not(target_os = "windows"))]
    pub fn current_process() -> Option<Self> {
        warn!("module queries are only supported on Windows");
        None
    }
}
