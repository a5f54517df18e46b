//! Symbol name demangling
//!
//! Demangling is an external service behind the [`Demangle`] trait. The
//! production implementation on Windows is DbgHelp's undecorator asked for a
//! bare name; [`TypeNameDemangler`] is a small portable decoder for the
//! `.?AV`-style names embedded in type descriptors, used on other targets
//! and in deterministic tests.

use crate::error::{Error, Result};

/// Recover a plain class name from a compiler-mangled byte string.
pub trait Demangle {
    /// Demangle `mangled` to name-only form: no arguments, no calling
    /// convention keywords, no leading underscore. A leading `.` separator
    /// is tolerated.
    fn demangle(&self, mangled: &str) -> Result<String>;
}

/// Portable decoder for MSVC type-descriptor names.
///
/// Handles the `?AV` (class), `?AU` (struct) and `?AW4` (enum) forms with
/// `@`-separated scope segments. Anything fancier (templates, anonymous
/// namespaces) is rejected rather than guessed at.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeNameDemangler;

impl Demangle for TypeNameDemangler {
    fn demangle(&self, mangled: &str) -> Result<String> {
        let failed = || Error::DemangleFailed(mangled.to_string());

        let rest = mangled.strip_prefix('.').unwrap_or(mangled);
        let rest = rest.strip_prefix("?A").ok_or_else(failed)?;
        let rest = if let Some(rest) = rest.strip_prefix("W4") {
            rest
        } else if rest.starts_with('V') || rest.starts_with('U') {
            &rest[1..]
        } else {
            return Err(failed());
        };

        let body = rest.find("@@").map(|i| &rest[..i]).ok_or_else(failed)?;
        if body.is_empty() {
            return Err(failed());
        }

        let mut segments = Vec::new();
        for segment in body.split('@') {
            if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_graphic()) {
                return Err(failed());
            }
            segments.push(segment);
        }

        // Mangled scope order is innermost-first.
        segments.reverse();
        Ok(segments.join("::"))
    }
}

/// DbgHelp-backed demangler.
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct DbgHelpDemangler;

#[cfg(target_os = "windows")]
impl Demangle for DbgHelpDemangler {
    fn demangle(&self, mangled: &str) -> Result<String> {
        use windows::Win32::System::Diagnostics::Debug::UnDecorateSymbolNameA;
        use windows::core::PCSTR;

        // DbgHelp flag values; name-only output without arguments,
        // convention keywords or leading underscores.
        const UNDNAME_NO_LEADING_UNDERSCORES: u32 = 0x0001;
        const UNDNAME_NO_MS_KEYWORDS: u32 = 0x0002;
        const UNDNAME_32_BIT_DECODE: u32 = 0x0800;
        const UNDNAME_NAME_ONLY: u32 = 0x1000;
        const UNDNAME_NO_ARGUMENTS: u32 = 0x2000;

        let failed = || Error::DemangleFailed(mangled.to_string());

        let trimmed = mangled.strip_prefix('.').unwrap_or(mangled);
        let input = std::ffi::CString::new(trimmed).map_err(|_| failed())?;
        let mut output = [0u8; 512];

        // SAFETY: input is nul-terminated and the output buffer bounds are
        // passed via the slice length.
        let len = unsafe {
            UnDecorateSymbolNameA(
                PCSTR(input.as_ptr().cast()),
                &mut output,
                UNDNAME_NO_ARGUMENTS
                    | UNDNAME_NAME_ONLY
                    | UNDNAME_32_BIT_DECODE
                    | UNDNAME_NO_MS_KEYWORDS
                    | UNDNAME_NO_LEADING_UNDERSCORES,
            )
        };
        if len == 0 {
            return Err(failed());
        }

        let name = String::from_utf8_lossy(&output[..len as usize]).into_owned();
        if name.is_empty() {
            return Err(failed());
        }
        Ok(name)
    }
}
