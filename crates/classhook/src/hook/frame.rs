//! Saved register state
//!
//! Every hook owns one [`RegisterFrame`] that its trampolines spill into and
//! reload from. The layout is fixed because generated machine code addresses
//! fields by constant displacement; vector slots are 32 bytes wide so the
//! same layout serves if wider stores are ever emitted.

/// Register spill area addressed by generated trampoline code.
///
/// General-purpose slots come first in [`Gpr`] frame order, then one 32-byte
/// slot per vector register.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct RegisterFrame {
    pub gpr: [u64; 16],
    pub xmm: [[u8; 32]; 16],
}

impl RegisterFrame {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Byte offset of a general-purpose slot from the frame start.
    pub const fn gpr_offset(register: Gpr) -> usize {
        register.slot() * 8
    }

    /// Byte offset of the `index`-th vector slot from the frame start.
    pub const fn xmm_offset(index: usize) -> usize {
        0x80 + index * 0x20
    }

    pub fn read_gpr(&self, register: Gpr) -> u64 {
        self.gpr[register.slot()]
    }
}

impl Default for RegisterFrame {
    fn default() -> Self {
        Self {
            gpr: [0; 16],
            xmm: [[0; 32]; 16],
        }
    }
}

/// General-purpose registers of the 64-bit register file.
///
/// Declaration order is frame order, which differs from the hardware
/// encoding: callee-saved rbx sits next to rax so frames read naturally in a
/// debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    /// Index of this register's slot in [`RegisterFrame::gpr`].
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Hardware register number used in ModRM/REX encoding.
    pub const fn code(self) -> u8 {
        match self {
            Gpr::Rax => 0,
            Gpr::Rcx => 1,
            Gpr::Rdx => 2,
            Gpr::Rbx => 3,
            Gpr::Rsp => 4,
            Gpr::Rbp => 5,
            Gpr::Rsi => 6,
            Gpr::Rdi => 7,
            Gpr::R8 => 8,
            Gpr::R9 => 9,
            Gpr::R10 => 10,
            Gpr::R11 => 11,
            Gpr::R12 => 12,
            Gpr::R13 => 13,
            Gpr::R14 => 14,
            Gpr::R15 => 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        assert_eq!(RegisterFrame::SIZE, 0x280);
        assert_eq!(RegisterFrame::gpr_offset(Gpr::Rax), 0);
        assert_eq!(RegisterFrame::gpr_offset(Gpr::Rcx), 0x10);
        assert_eq!(RegisterFrame::gpr_offset(Gpr::R15), 0x78);
        assert_eq!(RegisterFrame::xmm_offset(0), 0x80);
        assert_eq!(RegisterFrame::xmm_offset(15), 0x260);
    }

    #[test]
    fn test_gpr_codes_are_hardware_numbers() {
        assert_eq!(Gpr::Rax.code(), 0);
        assert_eq!(Gpr::Rcx.code(), 1);
        assert_eq!(Gpr::Rbx.code(), 3);
        assert_eq!(Gpr::Rsp.code(), 4);
        assert_eq!(Gpr::R8.code(), 8);
        assert_eq!(Gpr::R15.code(), 15);
    }

    #[test]
    fn test_frame_reads_by_slot() {
        let mut frame = RegisterFrame::default();
        frame.gpr[Gpr::Rcx.slot()] = 0x1234;
        assert_eq!(frame.read_gpr(Gpr::Rcx), 0x1234);
        assert_eq!(frame.read_gpr(Gpr::Rax), 0);
    }
}
