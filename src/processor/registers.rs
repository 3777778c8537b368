//! vCPU register state as exchanged with the hypervisor.

use alloc::{vec, vec::Vec};
use bitvec::{array::BitArray, order::Lsb0};
use core::fmt::{self, Write};

use super::segment::Segment;

/// General purpose registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub rip: u64,
}

/// RFLAGS bit 1. Reserved, always reads as one.
pub const RFLAGS_FIXED: u64 = 1 << 1;

impl Regs {
    pub fn dump(&self, out: &mut dyn Write, indent: usize) -> fmt::Result {
        writeln!(
            out,
            "{:indent$}rax: 0x{:016x} rbx: 0x{:016x} rcx: 0x{:016x} rdx: 0x{:016x}",
            "", self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            out,
            "{:indent$}rsi: 0x{:016x} rdi: 0x{:016x} rsp: 0x{:016x} rbp: 0x{:016x}",
            "", self.rsi, self.rdi, self.rsp, self.rbp
        )?;
        writeln!(
            out,
            "{:indent$}r8:  0x{:016x} r9:  0x{:016x} r10: 0x{:016x} r11: 0x{:016x}",
            "", self.r8, self.r9, self.r10, self.r11
        )?;
        writeln!(
            out,
            "{:indent$}r12: 0x{:016x} r13: 0x{:016x} r14: 0x{:016x} r15: 0x{:016x}",
            "", self.r12, self.r13, self.r14, self.r15
        )?;
        writeln!(out, "{:indent$}rip: 0x{:016x} rfl: 0x{:016x}", "", self.rip, self.rflags)
    }
}

/// A descriptor table register (GDTR or IDTR).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DTable {
    pub base: u64,
    pub limit: u16,
}

impl DTable {
    pub fn dump(&self, out: &mut dyn Write, indent: usize) -> fmt::Result {
        writeln!(out, "{:indent$}base: 0x{:016x} limit: 0x{:04x}", "", self.base, self.limit)
    }
}

/// Segment, descriptor table and control registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DTable,
    pub idt: DTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    /// One bit per vector, set for an external interrupt pending injection.
    pub interrupt_bitmap: [u64; 4],
}

impl Sregs {
    /// Returns the vector of the pending external interrupt, if any.
    pub fn pending_interrupt(&self) -> Option<u8> {
        let bitmap: BitArray<[u64; 4], Lsb0> = BitArray::new(self.interrupt_bitmap);
        bitmap.first_one().map(|vector| vector as u8)
    }

    pub fn dump(&self, out: &mut dyn Write, indent: usize) -> fmt::Result {
        let segments = [
            ("cs", &self.cs),
            ("ds", &self.ds),
            ("es", &self.es),
            ("fs", &self.fs),
            ("gs", &self.gs),
            ("ss", &self.ss),
            ("tr", &self.tr),
            ("ldt", &self.ldt),
        ];
        for (name, segment) in segments {
            writeln!(out, "{:indent$}{name}:", "")?;
            segment.dump(out, indent + 2)?;
        }
        writeln!(out, "{:indent$}gdt:", "")?;
        self.gdt.dump(out, indent + 2)?;
        writeln!(out, "{:indent$}idt:", "")?;
        self.idt.dump(out, indent + 2)?;
        writeln!(
            out,
            "{:indent$}cr0: 0x{:016x} cr2: 0x{:016x} cr3: 0x{:016x} cr4: 0x{:016x}",
            "", self.cr0, self.cr2, self.cr3, self.cr4
        )?;
        writeln!(
            out,
            "{:indent$}cr8: 0x{:016x} efer: 0x{:016x} apic_base: 0x{:016x}",
            "", self.cr8, self.efer, self.apic_base
        )?;
        if let Some(vector) = self.pending_interrupt() {
            writeln!(out, "{:indent$}pending interrupt: 0x{vector:02x}", "")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugRegs {
    pub db: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
    pub flags: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExceptionEvent {
    pub injected: bool,
    pub nr: u8,
    pub has_error_code: bool,
    pub pending: bool,
    pub error_code: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptEvent {
    pub injected: bool,
    pub nr: u8,
    pub soft: bool,
    pub shadow: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NmiEvent {
    pub injected: bool,
    pub pending: bool,
    pub masked: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmiEvent {
    pub smm: bool,
    pub pending: bool,
    pub smm_inside_nmi: bool,
    pub latched_init: u8,
}

/// Pending and in-flight events of a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuEvents {
    pub exception: ExceptionEvent,
    pub interrupt: InterruptEvent,
    pub nmi: NmiEvent,
    pub sipi_vector: u32,
    pub flags: u32,
    pub smi: SmiEvent,
    pub triple_fault_pending: bool,
    pub exception_has_payload: bool,
    pub exception_payload: u64,
}

/// The multiprocessing state of a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MpState(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum MpStateKind {
    Runnable = 0,
    Uninitialized = 1,
    InitReceived = 2,
    Halted = 3,
    SipiReceived = 4,
    Stopped = 5,
    CheckStop = 6,
    Operating = 7,
    Load = 8,
    ApResetHold = 9,
    Suspended = 10,
}

impl MpState {
    pub const RUNNABLE: Self = Self(MpStateKind::Runnable as u32);

    /// Returns the decoded state, or `None` for a value this crate does not
    /// know about.
    pub fn kind(self) -> Option<MpStateKind> {
        num_traits::FromPrimitive::from_u32(self.0)
    }
}

/// An extended control register and its value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Xcr {
    pub xcr: u32,
    pub value: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Xcrs {
    pub xcrs: Vec<Xcr>,
    pub flags: u32,
}

/// The size in bytes of the legacy extended state area.
pub const LEGACY_XSAVE_SIZE: usize = 4096;

/// An extended processor state area in the XSAVE layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xsave {
    region: Vec<u32>,
}

impl Xsave {
    /// Creates a zeroed area of `size` bytes, rounded up to a whole `u32`.
    pub fn with_size(size: usize) -> Self {
        Self {
            region: vec![0; size.div_ceil(4)],
        }
    }

    pub fn legacy() -> Self {
        Self::with_size(LEGACY_XSAVE_SIZE)
    }

    pub fn size(&self) -> usize {
        self.region.len() * 4
    }

    pub fn region(&self) -> &[u32] {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut [u32] {
        &mut self.region
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsrEntry {
    pub index: u32,
    pub data: u64,
}

impl MsrEntry {
    pub fn new(index: u32) -> Self {
        Self { index, data: 0 }
    }
}

/// The entry of a CPUID table, keyed by `function` and `index`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidEntry {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}
