//! Constructor-pattern scanning
//!
//! MSVC constructors of polymorphic classes install the vtable pointer with
//! a recognizable instruction pair:
//!
//! ```text
//! lea reg1, [rip+disp32]   ; 48 8D 05 ?? ?? ?? ??  (REX.R and reg masked)
//! mov [reg2], reg1         ; 48 89 ??              (REX.R/B masked)
//! ```
//!
//! The lea target is the vtable; the pointer-size slot immediately before it
//! holds the complete-object-locator pointer. Raw matches are cheap and
//! frequent, so operand fields of both instructions are cross-checked before
//! a match is treated as a constructor.

use memchr::memchr2_iter;
use tracing::trace;

use crate::image::Ibo32;

/// Byte length of the two-instruction window a match inspects.
pub const PATTERN_LEN: usize = 11;

/// A validated raw pattern match inside one code section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternHit {
    /// Vtable location the matched lea resolves to.
    pub vtable: Ibo32,
}

/// Scan one code section for constructor vtable stores.
///
/// `section_start` anchors match positions as image-relative offsets. Hits
/// are raw candidates; RTTI structure validation happens upstream.
pub fn scan_constructors(code: &[u8], section_start: Ibo32) -> Vec<PatternHit> {
    let mut hits = Vec::new();

    // First byte is a REX.W prefix with only REX.R free: 0x48 or 0x4C.
    for m in memchr2_iter(0x48, 0x4C, code) {
        let Some(window) = code.get(m..m + PATTERN_LEN) else {
            break;
        };
        if let Some(displacement) = match_window(window) {
            let vtable = Ibo32::new(
                section_start
                    .get()
                    .wrapping_add(m as i32)
                    .wrapping_add(7)
                    .wrapping_add(displacement),
            );
            trace!(at = %Ibo32::new(section_start.get().wrapping_add(m as i32)), %vtable, "constructor pattern hit");
            hits.push(PatternHit { vtable });
        }
    }

    hits
}

/// Validate one 11-byte window and extract the lea displacement.
fn match_window(w: &[u8]) -> Option<i32> {
    let (lea_rex, lea_modrm) = (w[0], w[2]);
    let (mov_rex, mov_modrm) = (w[7], w[9]);

    // lea reg,[rip+disp32]: opcode 8D, ModRM mod=00 rm=101, reg free.
    if w[1] != 0x8D || (lea_modrm & !0x38) != 0x05 {
        return None;
    }
    // mov [reg],reg: REX.W with R/B free, opcode 89.
    if w[8] != 0x89 || (mov_rex & !0x05) != 0x48 {
        return None;
    }
    // The store destination must be a plain register-indirect operand; a
    // RIP-relative or SIB-based destination is not a vtable install.
    if (mov_modrm & 0xC0) != 0 || matches!(mov_modrm & 0x07, 0x04 | 0x05) {
        return None;
    }
    // Both instructions must agree on the upper-register bit and on the
    // register moved: the stored register is the one lea just loaded.
    if (lea_rex ^ mov_rex) & 0x04 != 0 {
        return None;
    }
    if (lea_modrm ^ mov_modrm) & 0x38 != 0 {
        return None;
    }

    Some(i32::from_le_bytes(w[3..7].try_into().ok()?))
}
