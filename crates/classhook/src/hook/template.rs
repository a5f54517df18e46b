//! Trampoline code generation
//!
//! Hooks do not share static code blobs; each installation generates its own
//! position-independent x86-64 trampoline right after its [`HookHeader`].
//! All data the code touches (frame pointer, callback, continuation, scratch
//! slot) lives in that header and is addressed rip-relatively, so the block
//! works at whatever address the executable allocator returns and needs no
//! fixups when the chain around it changes.
//!
//! The generator assembles from an instruction vocabulary of exactly what
//! the four phases need; displacements into the header and to the local
//! resume label are recorded as relocations and patched in one pass at the
//! end.

use strum::Display;

use super::frame::{Gpr, RegisterFrame};
use super::header::HookHeader;

/// Where in the call the user callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Callback runs first with the original arguments, then the displaced
    /// function runs and returns to the caller.
    Entry,
    /// Displaced function runs first; callback runs after it and the
    /// original return value is restored before returning to the caller.
    Exit,
    /// Displaced function runs first; callback runs as a tail call and its
    /// return value is what the caller sees.
    Return,
    /// Callback runs first and receives a pointer to the full saved
    /// register frame as its argument.
    Context,
}

/// Which registers the trampoline preserves across the diversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RegisterSet {
    /// General-purpose argument registers only.
    Integer,
    /// General-purpose plus vector argument registers.
    IntegerVector,
}

/// One of the eight generated trampoline shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrampolineKind {
    pub phase: Phase,
    pub registers: RegisterSet,
}

impl TrampolineKind {
    pub const fn new(phase: Phase, registers: RegisterSet) -> Self {
        Self { phase, registers }
    }
}

impl std::fmt::Display for TrampolineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.phase, self.registers)
    }
}

/// Integer argument registers in Microsoft x64 call order.
const INT_ARGS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];

/// Vector argument registers preserved by the vector variants.
const VEC_ARGS: usize = 6;

/// Generate the trampoline body for one kind.
///
/// The returned code expects to be placed exactly [`HookHeader::SIZE`] bytes
/// after the start of its header.
pub fn generate(kind: TrampolineKind) -> Vec<u8> {
    let vector = kind.registers == RegisterSet::IntegerVector;
    let mut asm = Assembler::default();
    match kind.phase {
        Phase::Entry => emit_entry(&mut asm, vector),
        Phase::Exit => emit_exit(&mut asm, vector),
        Phase::Return => emit_return(&mut asm, vector),
        Phase::Context => emit_context(&mut asm, vector),
    }
    asm.finish()
}

/// Divert the callback before the displaced function.
fn emit_entry(asm: &mut Assembler, vector: bool) {
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    save_arguments(asm, Gpr::Rax, vector);
    divert(asm);
    asm.jmp_field(HookHeader::FN_NEW_OFFSET);

    asm.place_resume();
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    restore_arguments(asm, Gpr::Rax, vector);
    asm.push_field(HookHeader::EXTRA_OFFSET);
    asm.jmp_field(HookHeader::FN_HOOKED_OFFSET);
}

/// Run the displaced function, then call the callback and restore the
/// original return value.
fn emit_exit(asm: &mut Assembler, vector: bool) {
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    save_arguments(asm, Gpr::Rax, vector);
    divert(asm);
    asm.jmp_field(HookHeader::FN_HOOKED_OFFSET);

    asm.place_resume();
    capture_results(asm, vector);
    // Shadow space for the callback; 0x20 keeps the entry alignment the ABI
    // expects after the call pushes its return address.
    asm.emit(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 0x20
    asm.call_field(HookHeader::FN_NEW_OFFSET);
    asm.emit(&[0x48, 0x83, 0xC4, 0x20]); // add rsp, 0x20
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    asm.emit(&[0x48, 0x8B, 0x40, 0x00]); // mov rax, [rax] (saved return value)
    asm.jmp_indirect_field(HookHeader::EXTRA_OFFSET);
}

/// Run the displaced function, then tail-call the callback so its return
/// value reaches the caller.
fn emit_return(asm: &mut Assembler, vector: bool) {
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    save_arguments(asm, Gpr::Rax, vector);
    divert(asm);
    asm.jmp_field(HookHeader::FN_HOOKED_OFFSET);

    asm.place_resume();
    capture_results(asm, vector);
    asm.push_field(HookHeader::EXTRA_OFFSET);
    asm.jmp_field(HookHeader::FN_NEW_OFFSET);
}

/// Divert the callback with a pointer to the full register frame.
fn emit_context(asm: &mut Assembler, vector: bool) {
    // Spill rax through the stack so it lands in the frame before rax
    // becomes the frame base.
    asm.emit(&[0x50]); // push rax
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    asm.emit(&[0x8F, 0x00]); // pop [rax]

    for register in CONTEXT_SAVED {
        asm.store_gpr(Gpr::Rax, register);
    }
    if vector {
        for i in 0..16 {
            asm.store_xmm(Gpr::Rax, i, i);
        }
    }
    asm.emit(&[0x48, 0x89, 0xC1]); // mov rcx, rax (frame pointer argument)
    divert(asm);
    asm.jmp_field(HookHeader::FN_NEW_OFFSET);

    asm.place_resume();
    asm.load_field(Gpr::Rax, HookHeader::FRAME_OFFSET);
    if vector {
        for i in 0..16 {
            asm.load_xmm(Gpr::Rax, i, i);
        }
    }
    for register in CONTEXT_RESTORED {
        asm.load_gpr(Gpr::Rax, register);
    }
    asm.emit(&[0x48, 0x8B, 0x40, 0x00]); // mov rax, [rax] last; rax was the base
    asm.push_field(HookHeader::EXTRA_OFFSET);
    asm.jmp_field(HookHeader::FN_HOOKED_OFFSET);
}

/// Everything the context variant spills besides rax.
const CONTEXT_SAVED: [Gpr; 15] = [
    Gpr::Rbx,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsp,
    Gpr::Rbp,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Restored set excludes rsp (live) and the r10/r11 scratch registers.
const CONTEXT_RESTORED: [Gpr; 12] = [
    Gpr::Rbx,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rbp,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Swap the on-stack return address for the resume label and keep the
/// original in the header's scratch slot.
fn divert(asm: &mut Assembler) {
    asm.lea_resume();
    asm.emit(&[0x48, 0x87, 0x04, 0x24]); // xchg rax, [rsp]
    asm.store_field(HookHeader::EXTRA_OFFSET);
}

fn save_arguments(asm: &mut Assembler, base: Gpr, vector: bool) {
    for register in INT_ARGS {
        asm.store_gpr(base, register);
    }
    if vector {
        for i in 0..VEC_ARGS {
            asm.store_xmm(base, i, i);
        }
    }
}

fn restore_arguments(asm: &mut Assembler, base: Gpr, vector: bool) {
    for register in INT_ARGS {
        asm.load_gpr(base, register);
    }
    if vector {
        for i in 0..VEC_ARGS {
            asm.load_xmm(base, i, i);
        }
    }
}

/// At resume after the displaced function: preserve its return registers in
/// the frame (vector returns stash past the argument slots) and bring the
/// original arguments back for the callback.
fn capture_results(asm: &mut Assembler, vector: bool) {
    asm.load_field(Gpr::R10, HookHeader::FRAME_OFFSET);
    asm.store_gpr(Gpr::R10, Gpr::Rax);
    for register in INT_ARGS {
        asm.load_gpr(Gpr::R10, register);
    }
    if vector {
        for i in 0..4 {
            asm.store_xmm(Gpr::R10, i, VEC_ARGS + i);
        }
        for i in 0..VEC_ARGS {
            asm.load_xmm(Gpr::R10, i, i);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    /// Displacement to a header field, relative to the code start sitting
    /// [`HookHeader::SIZE`] bytes after the header.
    Field(usize),
    /// Displacement to the resume label inside the generated code.
    Resume,
}

#[derive(Debug, Default)]
struct Assembler {
    code: Vec<u8>,
    relocations: Vec<(usize, Target)>,
    resume: Option<usize>,
}

impl Assembler {
    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn reloc(&mut self, target: Target) {
        self.relocations.push((self.code.len(), target));
        self.emit(&[0; 4]);
    }

    /// `mov base, [rip+field]`; base is rax or r10.
    fn load_field(&mut self, base: Gpr, field: usize) {
        match base {
            Gpr::Rax => self.emit(&[0x48, 0x8B, 0x05]),
            Gpr::R10 => self.emit(&[0x4C, 0x8B, 0x15]),
            other => unreachable!("unsupported field base {other:?}"),
        }
        self.reloc(Target::Field(field));
    }

    /// `mov [rip+field], rax`
    fn store_field(&mut self, field: usize) {
        self.emit(&[0x48, 0x89, 0x05]);
        self.reloc(Target::Field(field));
    }

    /// `lea rax, [rip+resume]`
    fn lea_resume(&mut self) {
        self.emit(&[0x48, 0x8D, 0x05]);
        self.reloc(Target::Resume);
    }

    /// `jmp [header + field]` — jumps to the pointer stored in the field.
    fn jmp_field(&mut self, field: usize) {
        self.emit(&[0xFF, 0x25]);
        self.reloc(Target::Field(field));
    }

    /// Same encoding as [`Assembler::jmp_field`]; named separately where the
    /// field holds a raw address rather than a function pointer.
    fn jmp_indirect_field(&mut self, field: usize) {
        self.jmp_field(field);
    }

    /// `call [header + field]`
    fn call_field(&mut self, field: usize) {
        self.emit(&[0xFF, 0x15]);
        self.reloc(Target::Field(field));
    }

    /// `push [header + field]`
    fn push_field(&mut self, field: usize) {
        self.emit(&[0xFF, 0x35]);
        self.reloc(Target::Field(field));
    }

    /// `mov [base + frame_offset(register)], register`
    fn store_gpr(&mut self, base: Gpr, register: Gpr) {
        self.gpr_op(0x89, base, register);
    }

    /// `mov register, [base + frame_offset(register)]`
    fn load_gpr(&mut self, base: Gpr, register: Gpr) {
        self.gpr_op(0x8B, base, register);
    }

    fn gpr_op(&mut self, opcode: u8, base: Gpr, register: Gpr) {
        let (reg, rm) = (register.code(), base.code());
        let rex = 0x48 | ((reg & 8) >> 1) | ((rm & 8) >> 3);
        let modrm = 0x40 | ((reg & 7) << 3) | (rm & 7);
        let disp = RegisterFrame::gpr_offset(register) as u8;
        self.emit(&[rex, opcode, modrm, disp]);
    }

    /// `movaps [base + xmm_offset(slot)], xmm{index}`
    fn store_xmm(&mut self, base: Gpr, index: usize, slot: usize) {
        self.xmm_op(0x29, base, index, slot);
    }

    /// `movaps xmm{index}, [base + xmm_offset(slot)]`
    fn load_xmm(&mut self, base: Gpr, index: usize, slot: usize) {
        self.xmm_op(0x28, base, index, slot);
    }

    fn xmm_op(&mut self, opcode: u8, base: Gpr, index: usize, slot: usize) {
        let rm = base.code();
        let rex = (((index as u8) & 8) >> 1) | ((rm & 8) >> 3);
        if rex != 0 {
            self.emit(&[0x40 | rex]);
        }
        let modrm = 0x80 | (((index as u8) & 7) << 3) | (rm & 7);
        self.emit(&[0x0F, opcode, modrm]);
        self.emit(&(RegisterFrame::xmm_offset(slot) as u32).to_le_bytes());
    }

    fn place_resume(&mut self) {
        self.resume = Some(self.code.len());
    }

    /// Patch all recorded displacements and return the finished code.
    fn finish(mut self) -> Vec<u8> {
        for (at, target) in &self.relocations {
            let rip = match target {
                // Header fields sit before the code start.
                Target::Field(field) => {
                    *field as i64 - (HookHeader::SIZE + at + 4) as i64
                }
                Target::Resume => {
                    let resume = self.resume.expect("resume label placed before finish");
                    resume as i64 - (at + 4) as i64
                }
            };
            self.code[*at..at + 4].copy_from_slice(&(rip as i32).to_le_bytes());
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [TrampolineKind; 8] = [
        TrampolineKind::new(Phase::Entry, RegisterSet::Integer),
        TrampolineKind::new(Phase::Entry, RegisterSet::IntegerVector),
        TrampolineKind::new(Phase::Exit, RegisterSet::Integer),
        TrampolineKind::new(Phase::Exit, RegisterSet::IntegerVector),
        TrampolineKind::new(Phase::Return, RegisterSet::Integer),
        TrampolineKind::new(Phase::Return, RegisterSet::IntegerVector),
        TrampolineKind::new(Phase::Context, RegisterSet::Integer),
        TrampolineKind::new(Phase::Context, RegisterSet::IntegerVector),
    ];

    #[test]
    fn test_entry_addresses_frame_field() {
        let code = generate(TrampolineKind::new(Phase::Entry, RegisterSet::Integer));

        // mov rax, [rip+disp] reaching back over the code start into the
        // header's frame field.
        assert_eq!(&code[..3], &[0x48, 0x8B, 0x05]);
        let disp = i32::from_le_bytes(code[3..7].try_into().unwrap());
        assert_eq!(
            disp,
            HookHeader::FRAME_OFFSET as i32 - (HookHeader::SIZE + 7) as i32
        );
    }

    #[test]
    fn test_all_kinds_end_with_indirect_jmp() {
        for kind in ALL_KINDS {
            let code = generate(kind);
            assert_eq!(
                &code[code.len() - 6..code.len() - 4],
                &[0xFF, 0x25],
                "kind {kind} does not end in an indirect jmp"
            );
        }
    }

    #[test]
    fn test_vector_variants_are_longer() {
        for phase in [Phase::Entry, Phase::Exit, Phase::Return, Phase::Context] {
            let integer = generate(TrampolineKind::new(phase, RegisterSet::Integer));
            let vector = generate(TrampolineKind::new(phase, RegisterSet::IntegerVector));
            assert!(vector.len() > integer.len(), "phase {phase}");
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        for kind in ALL_KINDS {
            assert_eq!(generate(kind), generate(kind), "kind {kind}");
        }
    }

    #[test]
    fn test_resume_label_lands_inside_code() {
        for kind in ALL_KINDS {
            let code = generate(kind);
            // Find the single lea rax,[rip+..] and resolve its target.
            let at = code
                .windows(3)
                .position(|w| w == [0x48, 0x8D, 0x05])
                .unwrap_or_else(|| panic!("kind {kind} has no resume lea"));
            let disp = i32::from_le_bytes(code[at + 3..at + 7].try_into().unwrap());
            let resume = (at + 7) as i64 + disp as i64;
            assert!(
                resume > at as i64 && (resume as usize) < code.len(),
                "kind {kind} resume target {resume} out of range"
            );
        }
    }

    #[test]
    fn test_exit_calls_callback_with_shadow_space() {
        let code = generate(TrampolineKind::new(Phase::Exit, RegisterSet::Integer));
        let sub = code
            .windows(4)
            .position(|w| w == [0x48, 0x83, 0xEC, 0x20])
            .expect("no shadow space allocation");
        assert_eq!(&code[sub + 4..sub + 6], &[0xFF, 0x15]);
        assert_eq!(&code[sub + 10..sub + 14], &[0x48, 0x83, 0xC4, 0x20]);
    }

    #[test]
    fn test_context_spills_full_register_file() {
        let code = generate(TrampolineKind::new(Phase::Context, RegisterSet::Integer));
        assert_eq!(code[0], 0x50); // push rax
        assert_eq!(&code[1..4], &[0x48, 0x8B, 0x05]);
        assert_eq!(&code[8..10], &[0x8F, 0x00]); // pop [rax]

        // r15 spill: REX.R mov with the last frame slot displacement.
        let r15 = [
            0x4C,
            0x89,
            0x78,
            RegisterFrame::gpr_offset(Gpr::R15) as u8,
        ];
        assert!(code.windows(4).any(|w| w == r15));
    }

    #[test]
    fn test_high_xmm_spills_carry_rex() {
        let code = generate(TrampolineKind::new(Phase::Context, RegisterSet::IntegerVector));
        // movaps [rax+disp32], xmm8 needs a REX.R prefix.
        let mut xmm8 = vec![0x44, 0x0F, 0x29, 0x80];
        xmm8.extend_from_slice(&(RegisterFrame::xmm_offset(8) as u32).to_le_bytes());
        assert!(code.windows(8).any(|w| w == xmm8));
    }

    #[test]
    fn test_kind_display() {
        let kind = TrampolineKind::new(Phase::Entry, RegisterSet::IntegerVector);
        assert_eq!(kind.to_string(), "entry/integer_vector");
    }
}
