//! This module implements the architectural state of a test guest: paging
//! structures, descriptor tables, exception routing and vCPU state snapshots.

pub mod cpuid;
pub mod error;
pub mod gdt_tss;
pub mod guest;
pub mod interrupt_handlers;
pub mod paging_structures;
pub mod platform_ops;
pub mod registers;
pub mod segment;
#[cfg(test)]
pub(crate) mod testing;
pub mod vcpu_state;
pub mod vm;

/// The number of IDT entries. One gate per vector.
pub const NUM_INTERRUPTS: usize = 256;

/// GDT selector of the flat 64-bit kernel code segment.
pub const DEFAULT_CODE_SELECTOR: u16 = 0x8;

/// GDT selector of the flat kernel data segment.
pub const DEFAULT_DATA_SELECTOR: u16 = 0x10;

/// GDT selector of the 64-bit TSS. The descriptor occupies two slots.
pub const DEFAULT_TSS_SELECTOR: u16 = 0x18;

/// The number of pages backing each vCPU stack.
pub const DEFAULT_STACK_PGS: usize = 5;

/// The lowest guest virtual address a vCPU stack is placed at.
pub const DEFAULT_GUEST_STACK_VADDR_MIN: u64 = 0xab_6000;

/// The lowest guest virtual address handed out for internal allocations.
pub const MIN_VADDR: u64 = 0x2000;

/// The largest nested virtualization state accepted by a snapshot.
pub const NESTED_STATE_MAX_SIZE: usize = 0x4000;

/// The I/O port the guest accesses to signal the host.
pub const UCALL_PIO_PORT: u16 = 0x1000;

/// EFER bits touched when entering long mode.
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NX: u64 = 1 << 11;

/// Physical and virtual address widths with the guest page size.
///
/// Only [`VmMode::PxxV48_4K`], 4-level paging with 4KB base pages and the
/// host's physical address width, is supported. Passing any other mode to a
/// paging operation is a contract violation.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmMode {
    /// Host physical address width, 48-bit virtual address, 4KB pages.
    PxxV48_4K,
    /// 52-bit physical address, 48-bit virtual address, 4KB pages.
    P52V48_4K,
    /// 48-bit physical address, 48-bit virtual address, 4KB pages.
    P48V48_4K,
    /// 40-bit physical address, 48-bit virtual address, 4KB pages.
    P40V48_4K,
    /// 36-bit physical address, 48-bit virtual address, 4KB pages.
    P36V48_4K,
}
