//! A fixed-function assembler for runtime-generated routines.
//!
//! Unlike a general-purpose encoder, every method here produces exactly one
//! encoding, chosen once; gencode recognizers depend on that stability. The
//! assembler builds into an internal buffer destined for a known executable
//! address (`base_pc`), so branches to absolute targets can be resolved as
//! rel32 at emission time, while intra-routine branches go through [`Label`]s
//! resolved at [`Assembler::finish`].

use crate::reg;
use crate::rex::{emit_rex, low8_will_sign_extend_to_32_impl, modrm, sib, REX_BASE, REX_W};
use crate::sink::CodeSink;
use crate::IsaMode;

/// Segment-override prefix bytes for thread-local scratch addressing.
pub const SEG_FS: u8 = 0x64;
pub const SEG_GS: u8 = 0x65;

/// An x64 memory operand, restricted to the shapes gencode needs.
#[derive(Clone, Copy, Debug)]
pub enum Mem {
    /// `[base + disp]`, shortest displacement encoding.
    BaseDisp { base: u8, disp: i32 },
    /// A thread-local scratch slot: segment override plus absolute
    /// displacement (FS on 32-bit gencode, GS on 64-bit).
    Tls { offs: u16 },
    /// `[disp32]` without a segment override (32-bit gencode only).
    Abs32 { addr: u32 },
    /// RIP-relative to an absolute target (64-bit gencode only).
    RipRel { target: usize },
}

/// An unresolved intra-buffer branch target.
#[derive(Clone, Copy, Debug)]
pub struct Label(u32);

#[derive(Clone, Copy)]
enum FixupKind {
    Rel8,
    Rel32,
}

struct Fixup {
    disp_offset: usize,
    label: Label,
    kind: FixupKind,
}

pub struct Assembler {
    mode: IsaMode,
    base_pc: usize,
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    #[must_use]
    pub fn new(mode: IsaMode, base_pc: usize) -> Self {
        Self {
            mode,
            base_pc,
            buf: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> IsaMode {
        self.mode
    }

    /// Current offset from the start of the buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// The executable pc the current offset will land at.
    #[must_use]
    pub fn cur_pc(&self) -> usize {
        self.base_pc + self.buf.len()
    }

    /// Allocate a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(u32::try_from(self.labels.len() - 1).unwrap())
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.buf.len());
    }

    /// Resolve all fixups and return the finished bytes.
    ///
    /// # Panics
    ///
    /// Panics on an unbound label or an out-of-range rel8.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0 as usize].expect("unbound label");
            match fixup.kind {
                FixupKind::Rel8 => {
                    let rel = target as isize - (fixup.disp_offset as isize + 1);
                    let rel = i8::try_from(rel).expect("rel8 out of range");
                    self.buf[fixup.disp_offset] = rel as u8;
                }
                FixupKind::Rel32 => {
                    let rel = target as isize - (fixup.disp_offset as isize + 4);
                    let rel = i32::try_from(rel).expect("rel32 out of range");
                    self.buf[fixup.disp_offset..fixup.disp_offset + 4]
                        .copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        self.buf
    }

    fn is_x64(&self) -> bool {
        self.mode == IsaMode::X64
    }

    fn seg_prefix(&self) -> u8 {
        if self.is_x64() {
            SEG_GS
        } else {
            SEG_FS
        }
    }

    fn check_reg(&self, enc: u8) {
        if self.is_x64() {
            debug_assert!(enc < 16, "invalid register: {enc}");
        } else {
            debug_assert!(enc < 8, "register {enc} unavailable in 32-bit mode");
        }
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        if self.is_x64() {
            emit_rex(&mut self.buf, w, reg, index, rm);
        }
    }

    /// Emit legacy prefixes, REX, opcode bytes, and the ModR/M + SIB +
    /// displacement for a memory operand. `bytes_at_end` is how many
    /// immediate bytes will follow (needed for RIP-relative resolution).
    fn mem_op(&mut self, opcode: &[u8], reg: u8, mem: Mem, w: bool, bytes_at_end: u8) {
        self.check_reg(reg);
        let seg = self.seg_prefix();
        match mem {
            Mem::Tls { .. } => self.buf.put1(seg),
            Mem::BaseDisp { base, .. } => self.check_reg(base),
            Mem::Abs32 { .. } => debug_assert!(!self.is_x64(), "Abs32 is 32-bit-only"),
            Mem::RipRel { .. } => debug_assert!(self.is_x64(), "RipRel is 64-bit-only"),
        }
        match mem {
            Mem::BaseDisp { base, .. } => self.rex(w, reg, 0, base),
            _ => self.rex(w, reg, 0, 0),
        }
        self.buf.extend_from_slice(opcode);
        match mem {
            Mem::BaseDisp { base, disp } => {
                // rbp/r13 as a base requires an explicit displacement; rsp/r12
                // requires a SIB byte.
                let needs_disp = disp != 0 || (base & 7) == reg::RBP;
                let (m0d, disp_bytes) = if !needs_disp {
                    (0b00, 0)
                } else if low8_will_sign_extend_to_32_impl(disp) {
                    (0b01, 1)
                } else {
                    (0b10, 4)
                };
                if (base & 7) == reg::RSP {
                    self.buf.put1(modrm(m0d, reg, 0b100));
                    self.buf.put1(sib(0, 0b100, base));
                } else {
                    self.buf.put1(modrm(m0d, reg, base));
                }
                match disp_bytes {
                    0 => {}
                    1 => self.buf.put1(disp as u8),
                    _ => self.buf.put4(disp as u32),
                }
            }
            Mem::Tls { offs } => {
                if self.is_x64() {
                    self.buf.put1(modrm(0b00, reg, 0b100));
                    self.buf.put1(sib(0, 0b100, 0b101));
                } else {
                    self.buf.put1(modrm(0b00, reg, 0b101));
                }
                self.buf.put4(u32::from(offs));
            }
            Mem::Abs32 { addr } => {
                self.buf.put1(modrm(0b00, reg, 0b101));
                self.buf.put4(addr);
            }
            Mem::RipRel { target } => {
                self.buf.put1(modrm(0b00, reg, 0b101));
                let next = self.base_pc + self.buf.len() + 4 + usize::from(bytes_at_end);
                let rel = i32::try_from(target as isize - next as isize)
                    .expect("rip-relative target out of reach");
                self.buf.put4(rel as u32);
            }
        }
    }

    fn reg_op(&mut self, opcode: &[u8], reg: u8, rm: u8, w: bool) {
        self.check_reg(reg);
        self.check_reg(rm);
        self.rex(w, reg, 0, rm);
        self.buf.extend_from_slice(opcode);
        self.buf.put1(modrm(0b11, reg, rm));
    }

    // ---- moves ----

    /// `mov dst <- src` (full pointer width).
    pub fn mov_rr(&mut self, dst: u8, src: u8) {
        self.reg_op(&[0x8b], dst, src, true);
    }

    /// `mov dst <- mem` (full pointer width).
    pub fn mov_r_mem(&mut self, dst: u8, mem: Mem) {
        self.mem_op(&[0x8b], dst, mem, true, 0);
    }

    /// `mov mem <- src` (full pointer width).
    pub fn mov_mem_r(&mut self, mem: Mem, src: u8) {
        self.mem_op(&[0x89], src, mem, true, 0);
    }

    /// `mov dst <- imm` at pointer width: imm64 on x64, imm32 on x86 (the
    /// value is truncated to the mode's pointer width).
    pub fn mov_r_imm(&mut self, dst: u8, imm: u64) {
        self.check_reg(dst);
        if self.is_x64() {
            self.buf.put1(REX_BASE | REX_W | ((dst >> 3) & 1));
            self.buf.put1(0xb8 | (dst & 7));
            self.buf.put8(imm);
        } else {
            self.buf.put1(0xb8 | (dst & 7));
            self.buf.put4(imm as u32);
        }
    }

    /// `mov mem <- imm32` (32-bit store).
    pub fn mov_mem_imm32(&mut self, mem: Mem, imm: u32) {
        self.mem_op(&[0xc7], 0, mem, false, 4);
        self.buf.put4(imm);
    }

    /// `movzx dst <- src-low-byte`, pointer width destination.
    pub fn movzx_r_r8(&mut self, dst: u8, src: u8) {
        self.reg_op(&[0x0f, 0xb6], dst, src, true);
    }

    /// `mov reg-low-byte <- imm8`. Only the legacy byte registers
    /// (al/cl/dl/bl) are accepted so no REX is ever required.
    pub fn mov_r8_imm8(&mut self, dst: u8, imm: u8) {
        debug_assert!(dst < 4);
        self.buf.put1(0xb0 | dst);
        self.buf.put1(imm);
    }

    // ---- arithmetic ----

    /// `lea dst <- [base + disp]`.
    pub fn lea(&mut self, dst: u8, base: u8, disp: i32) {
        self.mem_op(&[0x8d], dst, Mem::BaseDisp { base, disp }, true, 0);
    }

    /// `and dst <- dst & mem`.
    pub fn and_r_mem(&mut self, dst: u8, mem: Mem) {
        self.mem_op(&[0x23], dst, mem, true, 0);
    }

    /// `and dst <- dst & imm32` (sign-extended on x64).
    pub fn and_r_imm32(&mut self, dst: u8, imm: u32) {
        self.check_reg(dst);
        self.rex(true, 0b100, 0, dst);
        self.buf.put1(0x81);
        self.buf.put1(modrm(0b11, 0b100, dst));
        self.buf.put4(imm);
    }

    /// `add dst <- dst + src`.
    pub fn add_rr(&mut self, dst: u8, src: u8) {
        self.reg_op(&[0x03], dst, src, true);
    }

    /// `add dst <- dst + mem`.
    pub fn add_r_mem(&mut self, dst: u8, mem: Mem) {
        self.mem_op(&[0x03], dst, mem, true, 0);
    }

    /// `shr dst, imm8`.
    pub fn shr_r_imm8(&mut self, dst: u8, imm: u8) {
        self.check_reg(dst);
        self.rex(true, 0b101, 0, dst);
        self.buf.put1(0xc1);
        self.buf.put1(modrm(0b11, 0b101, dst));
        self.buf.put1(imm);
    }

    /// `add al, imm8`.
    pub fn add_al_imm8(&mut self, imm: u8) {
        self.buf.put1(0x04);
        self.buf.put1(imm);
    }

    // ---- compares ----

    /// `cmp mem, src` at pointer width.
    pub fn cmp_mem_r(&mut self, mem: Mem, src: u8) {
        self.mem_op(&[0x39], src, mem, true, 0);
    }

    /// `cmp mem, imm8` at pointer width (imm sign-extended).
    pub fn cmp_mem_imm8(&mut self, mem: Mem, imm: i8) {
        self.mem_op(&[0x83], 0b111, mem, true, 1);
        self.buf.put1(imm as u8);
    }

    /// `cmp dword mem, imm32` (32-bit compare regardless of mode).
    pub fn cmp_mem32_imm32(&mut self, mem: Mem, imm: u32) {
        self.mem_op(&[0x81], 0b111, mem, false, 4);
        self.buf.put4(imm);
    }

    /// `cmp byte mem, imm8`.
    pub fn cmp_mem8_imm8(&mut self, mem: Mem, imm: u8) {
        self.mem_op(&[0x80], 0b111, mem, false, 1);
        self.buf.put1(imm);
    }

    /// `test a, b` at pointer width.
    pub fn test_rr(&mut self, a: u8, b: u8) {
        self.reg_op(&[0x85], b, a, true);
    }

    // ---- flags ----

    pub fn lahf(&mut self) {
        self.buf.put1(0x9f);
    }

    pub fn sahf(&mut self) {
        self.buf.put1(0x9e);
    }

    /// `seto %al`.
    pub fn seto_al(&mut self) {
        self.buf.extend_from_slice(&[0x0f, 0x90, 0xc0]);
    }

    pub fn pushf(&mut self) {
        self.buf.put1(0x9c);
    }

    pub fn popf(&mut self) {
        self.buf.put1(0x9d);
    }

    // ---- stack ----

    pub fn push_r(&mut self, r: u8) {
        self.check_reg(r);
        self.rex(false, 0, 0, r);
        self.buf.put1(0x50 | (r & 7));
    }

    pub fn pop_r(&mut self, r: u8) {
        self.check_reg(r);
        self.rex(false, 0, 0, r);
        self.buf.put1(0x58 | (r & 7));
    }

    pub fn push_imm8(&mut self, imm: i8) {
        self.buf.put1(0x6a);
        self.buf.put1(imm as u8);
    }

    /// `push mem` (pointer width; no REX.W needed).
    pub fn push_mem(&mut self, mem: Mem) {
        self.mem_op(&[0xff], 0b110, mem, false, 0);
    }

    // ---- control transfer ----

    /// `jmp rel32` to an absolute target.
    pub fn jmp_pc(&mut self, target: usize) {
        self.buf.put1(0xe9);
        self.put_rel32_to(target);
    }

    /// `call rel32` to an absolute target.
    pub fn call_pc(&mut self, target: usize) {
        self.buf.put1(0xe8);
        self.put_rel32_to(target);
    }

    /// `jmp rel32` to a label.
    pub fn jmp_label(&mut self, label: Label) {
        self.buf.put1(0xe9);
        self.push_fixup(label, FixupKind::Rel32);
    }

    /// `jmp rel8` to a label.
    pub fn jmp_short_label(&mut self, label: Label) {
        self.buf.put1(0xeb);
        self.push_fixup(label, FixupKind::Rel8);
    }

    /// `jcc rel32` to a label; `cc` is the condition nibble (e.g. 0x5 = ne).
    pub fn jcc_label(&mut self, cc: u8, label: Label) {
        debug_assert!(cc < 16);
        self.buf.put1(0x0f);
        self.buf.put1(0x80 | cc);
        self.push_fixup(label, FixupKind::Rel32);
    }

    /// `jcc rel8` to a label.
    pub fn jcc_short_label(&mut self, cc: u8, label: Label) {
        debug_assert!(cc < 16);
        self.buf.put1(0x70 | cc);
        self.push_fixup(label, FixupKind::Rel8);
    }

    /// `jcc rel32` to an absolute target.
    pub fn jcc_pc(&mut self, cc: u8, target: usize) {
        debug_assert!(cc < 16);
        self.buf.put1(0x0f);
        self.buf.put1(0x80 | cc);
        self.put_rel32_to(target);
    }

    /// `loop rel8` to a label (decrement xcx, branch if nonzero; flags-safe).
    pub fn loop_label(&mut self, label: Label) {
        self.buf.put1(0xe2);
        self.push_fixup(label, FixupKind::Rel8);
    }

    /// `jmp *mem`.
    pub fn jmp_mem(&mut self, mem: Mem) {
        self.mem_op(&[0xff], 0b100, mem, false, 0);
    }

    /// Emit `jmp rel32` with a zero displacement to be patched later;
    /// returns the buffer offset of the displacement.
    pub fn jmp_disp32_placeholder(&mut self) -> usize {
        self.buf.put1(0xe9);
        let at = self.buf.len();
        self.buf.put4(0);
        at
    }

    // ---- SIMD ----

    /// `movdqa xmm <- m128`.
    pub fn movdqa_x_mem(&mut self, x: u8, mem: Mem) {
        self.buf.put1(0x66);
        self.mem_op(&[0x0f, 0x6f], x, mem, false, 0);
    }

    /// `movdqa m128 <- xmm`.
    pub fn movdqa_mem_x(&mut self, mem: Mem, x: u8) {
        self.buf.put1(0x66);
        self.mem_op(&[0x0f, 0x7f], x, mem, false, 0);
    }

    /// `vmovdqa64 zmm <- m512` (unmasked, 64-bit gencode only).
    pub fn vmovdqa64_z_mem(&mut self, z: u8, mem: Mem) {
        self.evex_zmm(0x6f, z, mem);
    }

    /// `vmovdqa64 m512 <- zmm` (unmasked, 64-bit gencode only).
    pub fn vmovdqa64_mem_z(&mut self, mem: Mem, z: u8) {
        self.evex_zmm(0x7f, z, mem);
    }

    /// `kmovw k <- m16` (64-bit gencode only).
    pub fn kmovw_k_mem(&mut self, k: u8, mem: Mem) {
        self.vex_kmov(0x90, k, mem);
    }

    /// `kmovw m16 <- k` (64-bit gencode only).
    pub fn kmovw_mem_k(&mut self, mem: Mem, k: u8) {
        self.vex_kmov(0x91, k, mem);
    }

    fn evex_zmm(&mut self, opcode: u8, z: u8, mem: Mem) {
        debug_assert!(self.is_x64());
        debug_assert!(z < 16);
        let (base, disp) = match mem {
            Mem::BaseDisp { base, disp } => (base, disp),
            _ => panic!("EVEX forms are emitted base+disp only"),
        };
        // EVEX.512.66.0F.W1, zmm0-15, k0 unmasked, uncompressed disp32.
        let p0 = ((!z >> 3) & 1) << 7 | 1 << 6 | ((!base >> 3) & 1) << 5 | 1 << 4 | 0b01;
        self.buf.put1(0x62);
        self.buf.put1(p0);
        self.buf.put1(0xfd);
        self.buf.put1(0x48);
        self.buf.put1(opcode);
        if (base & 7) == reg::RSP {
            self.buf.put1(modrm(0b10, z, 0b100));
            self.buf.put1(sib(0, 0b100, base));
        } else {
            self.buf.put1(modrm(0b10, z, base));
        }
        self.buf.put4(disp as u32);
    }

    fn vex_kmov(&mut self, opcode: u8, k: u8, mem: Mem) {
        debug_assert!(self.is_x64());
        debug_assert!(k < 8);
        let (base, disp) = match mem {
            Mem::BaseDisp { base, disp } => (base, disp),
            _ => panic!("kmov forms are emitted base+disp only"),
        };
        if base < 8 {
            // 2-byte VEX: C5 [R̄ v̄v̄v̄v̄ L pp]
            self.buf.put1(0xc5);
            self.buf.put1(0xf8);
        } else {
            // 3-byte VEX with B̄ for the extended base.
            self.buf.put1(0xc4);
            self.buf.put1(0b1110_0001 & !(((base >> 3) & 1) << 5));
            self.buf.put1(0x78);
        }
        self.buf.put1(opcode);
        if (base & 7) == reg::RSP {
            self.buf.put1(modrm(0b10, k, 0b100));
            self.buf.put1(sib(0, 0b100, base));
        } else {
            self.buf.put1(modrm(0b10, k, base));
        }
        self.buf.put4(disp as u32);
    }

    // ---- raw escape hatch ----

    /// Append pre-encoded bytes, for callers that own a fixed template.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_rel32_to(&mut self, target: usize) {
        let next = self.base_pc + self.buf.len() + 4;
        let rel =
            i32::try_from(target as isize - next as isize).expect("rel32 target out of reach");
        self.buf.put4(rel as u32);
    }

    fn push_fixup(&mut self, label: Label, kind: FixupKind) {
        let disp_offset = self.buf.len();
        self.fixups.push(Fixup {
            disp_offset,
            label,
            kind,
        });
        match kind {
            FixupKind::Rel8 => self.buf.put1(0),
            FixupKind::Rel32 => self.buf.put4(0),
        }
    }
}

/// Condition-code nibbles for `jcc`.
pub mod cc {
    pub const O: u8 = 0x0;
    pub const Z: u8 = 0x4;
    pub const NZ: u8 = 0x5;
    pub const LE: u8 = 0xe;
}
