//! End-to-end byte-level scenarios: emit gencode, build fragments with real
//! exits, then link and unlink them and decode what a running thread would
//! see. Everything runs against an in-memory cache whose execute and
//! writable views coincide.

use fraglink_asm_x64::IsaMode;
use fraglink_runtime::context::Dcontext;
use fraglink_runtime::emit::{insert_relative_jump, pc_relative_target};
use fraglink_runtime::formats::{direct_stub_size, entrance_stub_size, indirect_stub_size};
use fraglink_runtime::ibl::IblEntry;
use fraglink_runtime::pad::{nop_pad_ilist, CtiForm, Inst, InstKind, InstList};
use fraglink_runtime::patch::{
    indirect_linkstub_stub_pc, link_direct_exit, link_indirect_exit, patch_branch,
    unlink_direct_exit, unlink_indirect_exit,
};
use fraglink_runtime::prefix::emit_fragment_prefix;
use fraglink_runtime::stub::{
    coarse_is_entrance_stub, emit_exit_stub, entrance_stub_jmp, entrance_stub_jmp_target,
    entrance_stub_target_tag, exit_stub_size,
};
use fraglink_runtime::tls::TlsSlot;
use fraglink_runtime::{
    CodeCache, Fragment, FragmentFlags, Gencode, IblBranchType, IblSourceKind, LinkStub,
    LinkStubKind, RuntimeConfig,
};
use more_asserts::{assert_ge, assert_le};

struct World {
    config: RuntimeConfig,
    cache: CodeCache,
    gencode: Gencode,
    cursor: usize,
}

impl World {
    fn new(mut config: RuntimeConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let cache = CodeCache::new_in_memory(1 << 20, 64);
        config.dispatch_fn = cache.base_pc();
        let gencode = Gencode::emit(&config, &cache, cache.base_pc() + 0x100).unwrap();
        let cursor = (gencode.end_pc + 63) & !63;
        Self {
            config,
            cache,
            gencode,
            cursor,
        }
    }

    fn x64() -> Self {
        Self::new(RuntimeConfig::new(IsaMode::X64))
    }

    /// Carve a cache-line-aligned region out of the cache.
    fn alloc(&mut self, size: usize) -> usize {
        let at = self.cursor;
        self.cursor = (at + size + 63) & !63;
        at
    }

    /// Build a fragment whose body is a single `jmp` exit CTI, with its
    /// stub right after the body. Returns the fragment and its exit; the
    /// linkstub is boxed because the stub bytes embed its address.
    fn fragment_with_one_exit(
        &mut self,
        tag: u64,
        flags: FragmentFlags,
        kind: LinkStubKind,
    ) -> (Fragment, Box<LinkStub>) {
        let start = self.alloc(128);
        let mut f = Fragment::new(tag, start, 128, flags);
        emit_fragment_prefix(&self.config, &self.cache, &mut f).unwrap();
        let cti_pc = f.normal_entry();
        let stub_pc = (cti_pc + 5 + 7) & !7;
        let l = Box::new(LinkStub::new(kind, cti_pc, stub_pc));
        // the body's exit jmp initially targets its own stub
        insert_relative_jump(&self.cache, cti_pc, stub_pc, false).unwrap();
        let n = emit_exit_stub(&self.config, &self.gencode, &self.cache, &f, &l).unwrap();
        assert_eq!(n, exit_stub_size(&self.config, &self.gencode, &f.flags, &l));
        (f, l)
    }
}

fn direct_kind(target_tag: u64) -> LinkStubKind {
    LinkStubKind::Direct { target_tag }
}

fn indirect_kind(bt: IblBranchType) -> LinkStubKind {
    LinkStubKind::Indirect { branch_type: bt }
}

#[test]
fn s1_direct_link_and_unlink() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, l) = w.fragment_with_one_exit(0x7000_1000, flags, direct_kind(0x7000_2000));

    // initial state: the stub's trailing jmp goes to fcache-return
    let size = direct_stub_size(IsaMode::X64);
    let jmp_pc = l.stub_pc + size - 5;
    assert_eq!(w.cache.read_u8(jmp_pc), 0xe9);
    assert_eq!(pc_relative_target(&w.cache, jmp_pc + 1), w.gencode.fcache_return());
    assert!(!l.linked.get());

    // a second fragment translating the target tag
    let mut g = Fragment::new(0x7000_2000, w.alloc(128), 128, flags);
    emit_fragment_prefix(&w.config, &w.cache, &mut g).unwrap();

    link_direct_exit(&w.cache, &f, &l, g.normal_entry(), true).unwrap();
    let disp = w.cache.read_i32(l.cti_pc + 1);
    assert_eq!(
        disp as i64,
        g.normal_entry() as i64 - (l.cti_pc as i64 + 5)
    );

    // linking twice is observationally the same
    let before = w.cache.read_bytes(l.cti_pc, 5);
    link_direct_exit(&w.cache, &f, &l, g.normal_entry(), true).unwrap();
    assert_eq!(before, w.cache.read_bytes(l.cti_pc, 5));

    unlink_direct_exit(&w.cache, &f, &l).unwrap();
    assert_eq!(pc_relative_target(&w.cache, l.cti_pc + 1), l.stub_pc);
    assert!(!l.linked.get());
}

#[test]
fn indirect_stub_wire_format_and_entries() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, l) =
        w.fragment_with_one_exit(0x7000_3000, flags, indirect_kind(IblBranchType::Return));
    let ibl = w.gencode.ibl(IblSourceKind::Bb, IblBranchType::Return);

    let size = indirect_stub_size(IsaMode::X64);
    let bytes = w.cache.read_bytes(l.stub_pc, size);
    // spill %rbx to gs:indirect-slot, then the 10-byte mov of &linkstub
    assert_eq!(&bytes[..3], &[0x65, 0x48, 0x89]);
    assert_eq!(&bytes[9..11], &[0x48, 0xbb]);
    let imm = u64::from_le_bytes(bytes[11..19].try_into().unwrap());
    assert_eq!(imm, l.addr() as u64);
    // trailing jmp starts at N-5 and initially targets the unlinked entry
    assert_eq!(bytes[size - 5], 0xe9);
    assert_eq!(
        pc_relative_target(&w.cache, l.stub_pc + size - 4),
        ibl.unlinked_entry
    );
    assert!(!l.linked.get());
    assert_eq!(
        indirect_linkstub_stub_pc(&w.config, &w.gencode, &w.cache, &f, &l),
        Some(l.stub_pc)
    );
}

#[test]
fn indirect_link_unlink_round_trip() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, l) =
        w.fragment_with_one_exit(0x7000_4000, flags, indirect_kind(IblBranchType::IndirectJump));
    let ibl = w.gencode.ibl(IblSourceKind::Bb, IblBranchType::IndirectJump);
    let disp_pc = l.stub_pc + indirect_stub_size(IsaMode::X64) - 4;

    link_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l, true).unwrap();
    assert!(l.linked.get());
    assert_eq!(pc_relative_target(&w.cache, disp_pc), ibl.linked_entry);

    unlink_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l).unwrap();
    assert!(!l.linked.get());
    assert_eq!(pc_relative_target(&w.cache, disp_pc), ibl.unlinked_entry);

    // unlinking an unlinked exit is a no-op
    let before = w.cache.read_bytes(l.stub_pc, 24);
    unlink_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l).unwrap();
    assert_eq!(before, w.cache.read_bytes(l.stub_pc, 24));
}

#[test]
fn trace_exits_use_trace_row() {
    let mut w = World::x64();
    let mut flags = FragmentFlags::new(IsaMode::X64);
    flags.is_trace = true;
    let (_f, l) =
        w.fragment_with_one_exit(0x7000_5000, flags, indirect_kind(IblBranchType::Return));
    let ibl = w.gencode.ibl(IblSourceKind::Trace, IblBranchType::Return);
    let disp_pc = l.stub_pc + indirect_stub_size(IsaMode::X64) - 4;
    assert_eq!(pc_relative_target(&w.cache, disp_pc), ibl.unlinked_entry);
}

#[test]
fn s6_coarse_entrance_stub_x64() {
    let mut w = World::x64();
    let mut flags = FragmentFlags::new(IsaMode::X64);
    flags.coarse_grain = true;
    let tag = 0x7fff_1234_5678u64;
    let (_f, l) = w.fragment_with_one_exit(0x7000_6000, flags, direct_kind(tag));

    let size = entrance_stub_size(IsaMode::X64);
    let bytes = w.cache.read_bytes(l.stub_pc, size);
    // two gs-prefixed 32-bit immediate stores: low half then high half
    assert_eq!(&bytes[..4], &[0x65, 0xc7, 0x04, 0x25]);
    assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0x1234_5678);
    assert_eq!(&bytes[12..16], &[0x65, 0xc7, 0x04, 0x25]);
    assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 0x0000_7fff);

    assert_eq!(entrance_stub_jmp(&w.cache, l.stub_pc), l.stub_pc + size - 5);
    assert_eq!(
        entrance_stub_jmp_target(&w.cache, l.stub_pc),
        w.gencode.fcache_return_coarse_prefix()
    );
    assert_eq!(entrance_stub_target_tag(&w.cache, l.stub_pc), tag);
    assert!(coarse_is_entrance_stub(&w.cache, l.stub_pc));
}

#[test]
fn coarse_entrance_stub_x86() {
    let mut w = World::new(RuntimeConfig::new(IsaMode::X86));
    let mut flags = FragmentFlags::new(IsaMode::X86);
    flags.coarse_grain = true;
    let tag = 0x0804_8123u64;
    let (_f, l) = w.fragment_with_one_exit(0x0804_7000, flags, direct_kind(tag));
    let bytes = w.cache.read_bytes(l.stub_pc, entrance_stub_size(IsaMode::X86));
    assert_eq!(&bytes[..4], &[0x67, 0x64, 0xc7, 0x06]);
    assert_eq!(u32::from_le_bytes(bytes[6..10].try_into().unwrap()), 0x0804_8123);
    assert_eq!(entrance_stub_target_tag(&w.cache, l.stub_pc), tag);
    assert!(coarse_is_entrance_stub(&w.cache, l.stub_pc));
}

#[test]
fn coarse_indirect_stub_rides_source_tag() {
    let mut w = World::x64();
    let mut flags = FragmentFlags::new(IsaMode::X64);
    flags.coarse_grain = true;
    let (_f, l) =
        w.fragment_with_one_exit(0x7000_7000, flags, indirect_kind(IblBranchType::IndirectCall));
    // coarse indirect exits are born linked, targeting the coarse prefix
    assert!(l.linked.get());
    let size = indirect_stub_size(IsaMode::X64);
    let bytes = w.cache.read_bytes(l.stub_pc, size);
    let imm = u64::from_le_bytes(bytes[11..19].try_into().unwrap());
    assert_eq!(imm, 0x7000_7000);
    assert_eq!(
        pc_relative_target(&w.cache, l.stub_pc + size - 4),
        w.gencode.coarse_ibl_prefix(IblBranchType::IndirectCall)
    );
}

#[test]
fn inline_stub_atomic_linking() {
    let mut config = RuntimeConfig::new(IsaMode::X86);
    config.inline_ibl.bb = true;
    let mut w = World::new(config);
    let flags = FragmentFlags::new(IsaMode::X86);
    let (f, l) =
        w.fragment_with_one_exit(0x0805_0000, flags, indirect_kind(IblBranchType::Return));
    let ibl = w.gencode.ibl(IblSourceKind::Bb, IblBranchType::Return);
    assert!(ibl.head_is_inlined);
    assert_ge!(ibl.inline_stub_length, 40);

    // created unlinked: the exit CTI targets the stub's unlink entry
    assert_eq!(
        pc_relative_target(&w.cache, l.cti_pc + 1),
        l.stub_pc + ibl.inline_unlink_offs
    );
    // both linkstub stores carry this exit's descriptor
    let imm32 = (l.addr() as u64) as u32;
    assert_eq!(
        w.cache.read_i32(l.stub_pc + ibl.inline_linkstub_first_offs) as u32,
        imm32
    );
    assert_eq!(
        w.cache.read_i32(l.stub_pc + ibl.inline_linkstub_second_offs) as u32,
        imm32
    );
    // the linked and unlinked jmps decode to the shared routine's entries
    assert_eq!(
        pc_relative_target(&w.cache, l.stub_pc + ibl.inline_linkedjmp_offs),
        ibl.linked_entry
    );
    assert_eq!(
        pc_relative_target(&w.cache, l.stub_pc + ibl.inline_unlinkedjmp_offs),
        ibl.unlinked_entry
    );
    assert_eq!(
        indirect_linkstub_stub_pc(&w.config, &w.gencode, &w.cache, &f, &l),
        Some(l.stub_pc)
    );

    // linking publishes with the single CTI patch
    link_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l, true).unwrap();
    assert_eq!(pc_relative_target(&w.cache, l.cti_pc + 1), l.stub_pc);

    unlink_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l).unwrap();
    assert_eq!(
        pc_relative_target(&w.cache, l.cti_pc + 1),
        l.stub_pc + ibl.inline_unlink_offs
    );
}

#[test]
fn s4_inline_stub_nonatomic_unlink_states() {
    let mut config = RuntimeConfig::new(IsaMode::X86);
    config.inline_ibl.bb = true;
    config.atomic_inlined_linking = false;
    let mut w = World::new(config);
    let flags = FragmentFlags::new(IsaMode::X86);
    let (f, l) =
        w.fragment_with_one_exit(0x0805_1000, flags, indirect_kind(IblBranchType::IndirectJump));
    let ibl = w.gencode.ibl(IblSourceKind::Bb, IblBranchType::IndirectJump);
    let ending_disp = l.stub_pc + ibl.inline_linkedjmp_offs;

    // unlinked at birth: ending jmp already points at the unlinked entry
    assert_eq!(pc_relative_target(&w.cache, ending_disp), ibl.unlinked_entry);

    link_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l, true).unwrap();
    assert_eq!(pc_relative_target(&w.cache, ending_disp), ibl.linked_entry);
    assert_eq!(pc_relative_target(&w.cache, l.cti_pc + 1), l.stub_pc);

    // unlink redirects the ending jmp first, then the exit CTI; the final
    // state is fully unlinked and both patch sites decode
    unlink_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l).unwrap();
    assert_eq!(pc_relative_target(&w.cache, ending_disp), ibl.unlinked_entry);
    assert_eq!(
        pc_relative_target(&w.cache, l.cti_pc + 1),
        l.stub_pc + ibl.inline_unlink_offs
    );
    // the race-detecting unlinked entry is the movzx inside the shared
    // routine: %cl == 1 discriminates an intentional unlink
    let movzx = w.cache.read_bytes(ibl.unlinked_entry, 3);
    assert_eq!(movzx, vec![0x0f, 0xb6, 0xc9]);
}

#[test]
fn stub_sizes_match_emission_for_all_kinds() {
    for mode in [IsaMode::X64, IsaMode::X86] {
        let mut w = World::new(RuntimeConfig::new(mode));
        for (coarse, kind) in [
            (false, direct_kind(0x11_0000)),
            (true, direct_kind(0x11_0000)),
            (false, indirect_kind(IblBranchType::Return)),
            (true, indirect_kind(IblBranchType::IndirectJump)),
        ] {
            let mut flags = FragmentFlags::new(mode);
            flags.coarse_grain = coarse;
            let (_f, l) = w.fragment_with_one_exit(0x11_2000, flags, kind);
            // every stub's patchable trailing displacement is line-contained
            let size = exit_stub_size(&w.config, &w.gencode, &flags, &l);
            let disp_pc = l.stub_pc + size - 4;
            assert_eq!(disp_pc / 64, (disp_pc + 3) / 64);
        }
    }
}

#[test]
fn prefix_entry_ordering_invariant() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, _l) = w.fragment_with_one_exit(0x12_0000, flags, direct_kind(0x12_1000));
    assert_le!(f.ibt_entry(), f.normal_entry());
    assert_le!(f.normal_entry(), f.end_pc());
    assert_eq!(f.ibt_entry() + usize::from(f.prefix_size), f.normal_entry());
}

#[test]
fn patch_branch_handles_every_long_cti() {
    let mut w = World::x64();
    let at = w.alloc(64);
    let target = w.gencode.fcache_return();
    // hinted jcc
    w.cache.write_bytes(at, &[0x3e, 0x0f, 0x8e, 0, 0, 0, 0]);
    patch_branch(&w.cache, at, target, false).unwrap();
    assert_eq!(pc_relative_target(&w.cache, at + 3), target);
}

/// An interpreter for the canonical 64-bit encodings the emitters produce,
/// just enough to walk a lookup from a fragment's exit CTI through its stub,
/// the shared probe, and a target prefix, against real table and dcontext
/// memory. Segment-addressed scratch accesses go to a simulated TLS region;
/// everything else reads and writes through the real addresses in play.
mod emu {
    use fraglink_runtime::tls::{TlsRegion, TLS_SLOT_COUNT};

    const RAX: usize = 0;

    #[derive(Clone, Copy)]
    enum Operand {
        Reg(usize),
        Mem(u64),
        Tls(usize),
    }

    fn fetch(pc: usize) -> u8 {
        unsafe { std::ptr::read(pc as *const u8) }
    }

    fn fetch_u32(pc: usize) -> u32 {
        unsafe { std::ptr::read_unaligned(pc as *const u32) }
    }

    fn fetch_u64(pc: usize) -> u64 {
        unsafe { std::ptr::read_unaligned(pc as *const u64) }
    }

    pub struct Machine {
        pub regs: [u64; 16],
        /// Flag state as `lahf` packs it (SF:ZF:0:AF:0:PF:1:CF); OF rides
        /// separately, as `seto`/`add $0x7f,%al` treat it.
        pub lahf_byte: u8,
        pub of: bool,
        pub tls: TlsRegion,
    }

    impl Machine {
        pub fn new() -> Self {
            Self {
                regs: [0; 16],
                lahf_byte: 0x02,
                of: false,
                tls: TlsRegion::new(),
            }
        }

        fn read(&self, op: Operand) -> u64 {
            match op {
                Operand::Reg(r) => self.regs[r],
                Operand::Mem(a) => unsafe { std::ptr::read_unaligned(a as usize as *const u64) },
                Operand::Tls(i) => self.tls.slots[i],
            }
        }

        fn write(&mut self, op: Operand, v: u64) {
            match op {
                Operand::Reg(r) => self.regs[r] = v,
                Operand::Mem(a) => unsafe {
                    std::ptr::write_unaligned(a as usize as *mut u64, v);
                },
                Operand::Tls(i) => self.tls.slots[i] = v,
            }
        }

        fn zf(&self) -> bool {
            self.lahf_byte & 0x40 != 0
        }

        fn set_zf(&mut self, z: bool) {
            if z {
                self.lahf_byte |= 0x40;
            } else {
                self.lahf_byte &= !0x40;
            }
        }

        fn tls_index(disp: u32) -> usize {
            assert_eq!(disp % 8, 0, "unaligned tls access");
            let i = (disp / 8) as usize;
            assert!(i < TLS_SLOT_COUNT, "tls access out of range");
            i
        }

        /// Decode a ModR/M operand; returns (reg field, operand, next pc).
        fn modrm(&self, pc: usize, rex: u8, seg: bool) -> (usize, Operand, usize) {
            let m = fetch(pc);
            let mut pc = pc + 1;
            let mod_ = m >> 6;
            let regf = usize::from(((m >> 3) & 7) | ((rex >> 2) & 1) << 3);
            let rm = usize::from((m & 7) | (rex & 1) << 3);
            if mod_ == 3 {
                return (regf, Operand::Reg(rm), pc);
            }
            if (m & 7) == 4 {
                let s = fetch(pc);
                pc += 1;
                assert_eq!(s, 0x25, "only the absolute-disp32 SIB form is emitted");
                assert_eq!(mod_, 0);
                let disp = fetch_u32(pc);
                pc += 4;
                let op = if seg {
                    Operand::Tls(Self::tls_index(disp))
                } else {
                    Operand::Mem(u64::from(disp))
                };
                return (regf, op, pc);
            }
            assert!(!(mod_ == 0 && (m & 7) == 5), "rip-relative is not emulated");
            let base = self.regs[rm];
            let (disp, len) = match mod_ {
                0 => (0i64, 0),
                1 => (i64::from(fetch(pc) as i8), 1),
                _ => (i64::from(fetch_u32(pc) as i32), 4),
            };
            (regf, Operand::Mem(base.wrapping_add(disp as u64)), pc + len)
        }

        fn cond(&self, cc: u8) -> bool {
            match cc & 0xf {
                0x4 => self.zf(),
                0x5 => !self.zf(),
                other => panic!("unexpected condition {other:#x}"),
            }
        }

        fn rel8(pc: usize) -> usize {
            (pc as i64 + 1 + i64::from(fetch(pc) as i8)) as usize
        }

        fn rel32(pc: usize) -> usize {
            (pc as i64 + 4 + i64::from(fetch_u32(pc) as i32)) as usize
        }

        /// Step until one of `stop` is reached; panics if the budget runs
        /// out first.
        pub fn run(&mut self, mut pc: usize, stop: &[usize]) -> usize {
            for _ in 0..256 {
                if stop.contains(&pc) {
                    return pc;
                }
                pc = self.step(pc);
            }
            panic!("no stop pc reached; at {pc:#x}");
        }

        fn step(&mut self, mut pc: usize) -> usize {
            let mut seg = false;
            let mut rex = 0u8;
            loop {
                match fetch(pc) {
                    // the addr-size prefix only shrinks a moffs here
                    0x67 => pc += 1,
                    0x64 | 0x65 => {
                        seg = true;
                        pc += 1;
                    }
                    b @ 0x40..=0x4f => {
                        rex = b;
                        pc += 1;
                    }
                    _ => break,
                }
            }
            let op = fetch(pc);
            pc += 1;
            match op {
                0x89 => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    let v = self.regs[r];
                    self.write(m, v);
                    next
                }
                0x8b => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    let v = self.read(m);
                    self.regs[r] = v;
                    next
                }
                0x03 => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    let v = self.regs[r].wrapping_add(self.read(m));
                    self.regs[r] = v;
                    self.set_zf(v == 0);
                    next
                }
                0x23 => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    let v = self.regs[r] & self.read(m);
                    self.regs[r] = v;
                    self.set_zf(v == 0);
                    next
                }
                0x39 => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    let z = self.read(m) == self.regs[r];
                    self.set_zf(z);
                    self.of = false;
                    next
                }
                0x83 => {
                    let (ext, m, next) = self.modrm(pc, rex, seg);
                    assert_eq!(ext, 7, "only the cmp form of group 1 is emitted");
                    let imm = fetch(next) as i8 as i64 as u64;
                    let z = self.read(m) == imm;
                    self.set_zf(z);
                    self.of = false;
                    next + 1
                }
                0x8d => {
                    let (r, m, next) = self.modrm(pc, rex, seg);
                    match m {
                        Operand::Mem(a) => self.regs[r] = a,
                        _ => panic!("lea of a non-address"),
                    }
                    next
                }
                0xa1 => {
                    assert!(seg);
                    self.regs[RAX] = self.tls.slots[Self::tls_index(fetch_u32(pc))];
                    pc + 4
                }
                0xa3 => {
                    assert!(seg);
                    self.tls.slots[Self::tls_index(fetch_u32(pc))] = self.regs[RAX];
                    pc + 4
                }
                0xb8..=0xbf => {
                    let r = usize::from((op & 7) | (rex & 1) << 3);
                    if rex & 8 != 0 {
                        self.regs[r] = fetch_u64(pc);
                        pc + 8
                    } else {
                        self.regs[r] = u64::from(fetch_u32(pc));
                        pc + 4
                    }
                }
                0x0f => {
                    let op2 = fetch(pc);
                    pc += 1;
                    match op2 {
                        0x80..=0x8f => {
                            if self.cond(op2) {
                                Self::rel32(pc)
                            } else {
                                pc + 4
                            }
                        }
                        0x90 => {
                            assert_eq!(fetch(pc), 0xc0, "seto targets %al");
                            self.regs[RAX] =
                                (self.regs[RAX] & !0xff) | u64::from(self.of);
                            pc + 1
                        }
                        0xb6 => {
                            let (r, m, next) = self.modrm(pc, rex, seg);
                            let v = self.read(m) & 0xff;
                            self.regs[r] = v;
                            next
                        }
                        other => panic!("unhandled 0f opcode {other:#x}"),
                    }
                }
                0x70..=0x7f => {
                    if self.cond(op) {
                        Self::rel8(pc)
                    } else {
                        pc + 1
                    }
                }
                0xe9 => Self::rel32(pc),
                0xeb => Self::rel8(pc),
                0xe2 => {
                    self.regs[1] = self.regs[1].wrapping_sub(1);
                    if self.regs[1] != 0 {
                        Self::rel8(pc)
                    } else {
                        pc + 1
                    }
                }
                0xff => {
                    let (ext, m, next) = self.modrm(pc, rex, seg);
                    let _ = next;
                    assert_eq!(ext, 4, "only indirect jmp is emulated");
                    self.read(m) as usize
                }
                0x04 => {
                    let al = (self.regs[RAX] & 0xff) as u8;
                    let imm = fetch(pc);
                    let res = al.wrapping_add(imm);
                    self.of = ((al ^ res) & (imm ^ res) & 0x80) != 0;
                    self.regs[RAX] = (self.regs[RAX] & !0xff) | u64::from(res);
                    self.set_zf(res == 0);
                    pc + 1
                }
                0x9e => {
                    self.lahf_byte = (self.regs[RAX] >> 8) as u8;
                    pc
                }
                0x9f => {
                    self.regs[RAX] =
                        (self.regs[RAX] & !0xff00) | (u64::from(self.lahf_byte) << 8);
                    pc
                }
                other => panic!("unhandled opcode {other:#x} at {:#x}", pc - 1),
            }
        }
    }
}

/// Register state an application thread would carry into an indirect exit.
struct AppState {
    xax: u64,
    xbx: u64,
    xcx: u64,
    xdi: u64,
    lahf_byte: u8,
    of: bool,
}

const APP: AppState = AppState {
    xax: 0x3333_0000_0001,
    xbx: 0x1111_0000_0002,
    xcx: 0x2222_0000_0003,
    xdi: 0x4444_0000_0004,
    lahf_byte: 0xc3,
    of: true,
};

fn slot(s: TlsSlot) -> usize {
    usize::from(s.offset(IsaMode::X64)) / 8
}

/// Set up a machine the way a mangled indirect branch leaves one: target in
/// XCX, app XCX spilled to TLS, the dcontext reachable, and app flags live.
fn machine_at_exit(target: u64, dc_addr: u64, table: &[IblEntry]) -> emu::Machine {
    let mut m = emu::Machine::new();
    m.regs[0] = APP.xax;
    m.regs[3] = APP.xbx;
    m.regs[1] = target;
    m.regs[7] = APP.xdi;
    m.lahf_byte = APP.lahf_byte;
    m.of = APP.of;
    m.tls.slots[slot(TlsSlot::XcxSpill)] = APP.xcx;
    m.tls.slots[slot(TlsSlot::DcontextBase)] = dc_addr;
    m.tls.slots[slot(TlsSlot::Mask(IblBranchType::Return))] = (table.len() - 1) as u64;
    m.tls.slots[slot(TlsSlot::Table(IblBranchType::Return))] = table.as_ptr() as u64;
    m
}

#[test]
fn s2_ibl_hit_reaches_ibt_entry_with_state_restored() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, l) =
        w.fragment_with_one_exit(0x7000_8000, flags, indirect_kind(IblBranchType::Return));
    link_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l, true).unwrap();

    // target fragment translating T, reachable through bucket T & mask
    let target_tag = 0x7000_8004u64;
    let mut g = Fragment::new(target_tag, w.alloc(128), 128, flags);
    emit_fragment_prefix(&w.config, &w.cache, &mut g).unwrap();
    let mut table = vec![IblEntry::empty(); 8];
    table[7] = IblEntry::sentinel();
    table[(target_tag & 7) as usize] = IblEntry {
        tag: target_tag,
        start_pc: g.ibt_entry() as u64,
    };

    let mut dc = Box::new(Dcontext::zeroed());
    let dc_ptr: *mut Dcontext = &mut *dc;
    let mut m = machine_at_exit(target_tag, dc_ptr as u64, &table);
    let stop = m.run(l.cti_pc, &[g.normal_entry(), w.gencode.fcache_return()]);

    // the lookup hits, enters at the IBT prefix, and the prefix leaves the
    // thread at the normal entry with application state intact
    assert_eq!(stop, g.normal_entry());
    assert_eq!(m.regs[0], APP.xax);
    assert_eq!(m.regs[3], APP.xbx);
    assert_eq!(m.regs[1], APP.xcx);
    assert_eq!(m.regs[7], APP.xdi);
    assert_eq!(m.lahf_byte, APP.lahf_byte);
    assert_eq!(m.of, APP.of);
}

#[test]
fn s3_ibl_miss_reaches_fcache_return_via_sentinel() {
    let mut w = World::x64();
    let flags = FragmentFlags::new(IsaMode::X64);
    let (f, l) =
        w.fragment_with_one_exit(0x7000_9000, flags, indirect_kind(IblBranchType::Return));
    link_indirect_exit(&w.config, &w.gencode, &w.cache, &f, &l, true).unwrap();

    // no entry translates T; T hashes to the sentinel bucket so the probe
    // wraps once before giving up on the empty slot at the table start
    let target_tag = 0x7000_9007u64;
    let mut table = vec![IblEntry::empty(); 8];
    table[7] = IblEntry::sentinel();

    let mut dc = Box::new(Dcontext::zeroed());
    let dc_ptr: *mut Dcontext = &mut *dc;
    let mut m = machine_at_exit(target_tag, dc_ptr as u64, &table);
    let stop = m.run(l.cti_pc, &[w.gencode.fcache_return()]);

    assert_eq!(stop, w.gencode.fcache_return());
    // the dispatcher's view of the exit: &linkstub in XAX, the application
    // target in next_tag, app XAX handed over in the direct-stub slot
    assert_eq!(m.regs[0], l.addr() as u64);
    assert_eq!(unsafe { (*dc_ptr).next_tag }, target_tag);
    assert_eq!(m.tls.slots[slot(TlsSlot::DirectStubSpill)], APP.xax);
    assert_eq!(m.regs[3], APP.xbx);
    assert_eq!(m.regs[1], APP.xcx);
    assert_eq!(m.regs[7], APP.xdi);
    assert_eq!(m.lahf_byte, APP.lahf_byte);
    assert_eq!(m.of, APP.of);
}

#[test]
fn s5_cache_line_padding_at_line_tail() {
    // a hinted jcc naturally at body offset 58 puts its displacement at
    // 61..65, straddling the 64-byte line: the pass owes exactly 3 bytes
    let mut config = RuntimeConfig::new(IsaMode::X86);
    config.bb_prefixes = false;
    let mut flags = FragmentFlags::new(IsaMode::X86);
    flags.coarse_grain = true; // no prefix: body offsets == line offsets
    flags.pad_jmps = true;

    let build = |shift_start: bool| {
        let mut f = Fragment::new(0x1000, 0x10_0000, 256, flags);
        f.flags.pad_jmps_shift_start = shift_start;
        let mut ilist = InstList::new();
        ilist.push(Inst::regular(58));
        ilist.push(Inst::exit_cti(CtiForm::Jcc { hint: true }, true));
        let shift = nop_pad_ilist(&config, &f, &mut ilist, true);
        (f, ilist, shift)
    };

    // NOP variant: a 3-byte NOP lands at offset 58 and the CTI at 61, so
    // its last 4 bytes occupy 64..68, starting exactly on the line boundary
    let (f, ilist, shift) = build(false);
    assert_eq!(shift, 0);
    assert_eq!(ilist.insts.len(), 3);
    assert!(matches!(ilist.insts[1].kind, InstKind::Nop));
    assert_eq!(ilist.insts[1].len, 3);
    assert_eq!(ilist.insts[1].offset, 58);
    assert!(ilist.insts[2].padded);
    assert_eq!(ilist.insts[2].offset, 61);
    let disp_pc = f.start_pc + 61 + 7 - 4;
    assert_eq!(disp_pc % 64, 0);
    assert_eq!(disp_pc / 64, (disp_pc + 3) / 64);

    // shift variant: the one-time start shift of 3 replaces the NOP
    let (_f, ilist, shift) = build(true);
    assert_eq!(shift, 3);
    assert_eq!(ilist.insts.len(), 2);
    assert!(!ilist.insts[1].padded);
}
