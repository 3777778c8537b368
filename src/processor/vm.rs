//! This module binds guest memory, the paging structures and the descriptor
//! tables of a single test VM.

use core::{
    fmt::Write,
    sync::atomic::AtomicU64,
};
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

use super::{
    EFER_NX, MIN_VADDR, VmMode,
    cpuid::CpuidCache,
    error::{Error, IoctlResultExt},
    interrupt_handlers::EXCEPTION_HANDLERS,
    paging_structures::{Entry, PageLevel, PagingStructures, reserved_bits_mask},
    platform_ops::{GuestMemory, VcpuOps},
};

/// A test VM's guest-side architectural state.
#[derive(Debug)]
pub struct GuestVm<M: GuestMemory> {
    mem: M,
    paging: PagingStructures,
    pub(crate) gdt: Option<u64>,
    pub(crate) tss: Option<u64>,
    pub(crate) idt: Option<u64>,
    pub(crate) handlers: Option<u64>,
    handlers_pointer: u64,
}

impl<M: GuestMemory> GuestVm<M> {
    pub fn new(mem: M, mode: VmMode) -> Self {
        Self {
            mem,
            paging: PagingStructures::new(mode),
            gdt: None,
            tss: None,
            idt: None,
            handlers: None,
            handlers_pointer: core::ptr::addr_of!(EXCEPTION_HANDLERS) as u64,
        }
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn paging(&self) -> &PagingStructures {
        &self.paging
    }

    /// Returns the guest virtual address of the GDT, if built.
    pub fn gdt(&self) -> Option<u64> {
        self.gdt
    }

    /// Returns the guest virtual address of the TSS, if built.
    pub fn tss(&self) -> Option<u64> {
        self.tss
    }

    /// Returns the guest virtual address of the IDT, if built.
    pub fn idt(&self) -> Option<u64> {
        self.idt
    }

    /// Returns the guest virtual address of the exception handler table, if
    /// built.
    pub fn handlers(&self) -> Option<u64> {
        self.handlers
    }

    /// Returns the guest virtual address of the guest's pointer to the
    /// exception handler table.
    pub fn handlers_pointer(&self) -> u64 {
        self.handlers_pointer
    }

    /// Overrides where the guest's pointer to the exception handler table
    /// lives. By default it is the address of [`EXCEPTION_HANDLERS`], which
    /// holds when the guest image is mapped at its host address.
    pub fn set_handlers_pointer(&mut self, gva: u64) {
        self.handlers_pointer = gva;
    }

    /// Allocates the root of the paging structures unless already done.
    pub fn pgd_alloc(&mut self) -> u64 {
        self.paging.alloc_root(&mut self.mem)
    }

    pub fn map_page(&mut self, vaddr: u64, paddr: u64, level: PageLevel) {
        self.paging.map(&mut self.mem, vaddr, paddr, level);
    }

    /// Maps `count` 4KB pages starting at `vaddr` to the physical pages
    /// starting at `paddr`.
    pub fn map_range(&mut self, vaddr: u64, paddr: u64, count: usize) {
        for i in 0..count as u64 {
            let offset = i << BASE_PAGE_SHIFT;
            self.map_page(vaddr + offset, paddr + offset, PageLevel::Size4K);
        }
    }

    /// Translates `gva` into a guest physical address. The address must be
    /// mapped.
    pub fn gva2gpa(&self, gva: u64) -> u64 {
        self.paging.translate(&self.mem, gva)
    }

    /// Translates `gva` into a host address. The address must be mapped.
    pub fn gva2hva(&self, gva: u64) -> *mut u8 {
        self.mem.gpa2hva(self.gva2gpa(gva))
    }

    /// Allocates `count` pages of backed and mapped guest virtual memory at or
    /// above `min_gva`.
    pub fn vaddr_alloc(&mut self, count: usize, min_gva: u64) -> u64 {
        self.pgd_alloc();
        let gva = self.mem.reserve_vaddr(count, min_gva);
        let gpa = self.mem.alloc_pages(count);
        self.map_range(gva, gpa, count);
        gva
    }

    /// Allocates a single backed and mapped page for internal structures.
    pub fn vaddr_alloc_page(&mut self) -> u64 {
        self.vaddr_alloc(1, MIN_VADDR)
    }

    /// Returns a page of guest memory mapped at `gva` as a slice of `T`.
    ///
    /// # Safety
    ///
    /// `gva` must be page aligned and mapped, and every bit pattern must be a
    /// valid `T`.
    pub(crate) unsafe fn page_mut<T>(&mut self, gva: u64) -> &mut [T] {
        let hva = self.gva2hva(gva).cast::<T>();
        unsafe { core::slice::from_raw_parts_mut(hva, BASE_PAGE_SIZE / size_of::<T>()) }
    }

    /// Returns the 4KB leaf entry mapping `gva` for in-place editing.
    ///
    /// The reserved bit mask is recomputed from the supported physical
    /// address width and the vCPU's current EFER.NX.
    pub fn page_table_entry<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &V,
        cpuid: &CpuidCache,
        gva: u64,
    ) -> Result<&mut Entry, Error> {
        let max_phy_addr = cpuid.supported_entry(0x8000_0008, 0)?.eax & 0xff;
        let sregs = vcpu.get_sregs().ioctl("KVM_GET_SREGS")?;
        let reserved_mask = reserved_bits_mask(max_phy_addr, sregs.efer & EFER_NX != 0);
        Ok(self.paging.leaf_entry_mut(&mut self.mem, gva, reserved_mask))
    }

    /// Returns the raw value of the leaf entry mapping `gva`.
    pub fn get_page_table_entry<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &V,
        cpuid: &CpuidCache,
        gva: u64,
    ) -> Result<u64, Error> {
        Ok(self.page_table_entry(vcpu, cpuid, gva)?.bits())
    }

    /// Overwrites the leaf entry mapping `gva` with `value`.
    pub fn set_page_table_entry<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &V,
        cpuid: &CpuidCache,
        gva: u64,
        value: u64,
    ) -> Result<(), Error> {
        *self.page_table_entry(vcpu, cpuid, gva)? = Entry::from_bits(value);
        Ok(())
    }

    /// Writes the paging structures, indented by `indent` spaces.
    pub fn dump(&self, out: &mut dyn Write, indent: usize) -> core::fmt::Result {
        self.paging.dump(&self.mem, out, indent)
    }
}

/// Places up to six integer arguments into the registers the System V calling
/// convention passes them in.
pub fn set_args<V: VcpuOps + ?Sized>(vcpu: &mut V, args: &[u64]) -> Result<(), Error> {
    if args.is_empty() || args.len() > 6 {
        return Err(Error::InvalidArgCount(args.len()));
    }

    let mut regs = vcpu.get_regs().ioctl("KVM_GET_REGS")?;
    let slots = [
        &mut regs.rdi,
        &mut regs.rsi,
        &mut regs.rdx,
        &mut regs.rcx,
        &mut regs.r8,
        &mut regs.r9,
    ];
    for (slot, arg) in slots.into_iter().zip(args) {
        *slot = *arg;
    }
    vcpu.set_regs(&regs).ioctl("KVM_SET_REGS")
}

/// Writes the general purpose and system registers of `vcpu`.
pub fn dump_vcpu<V: VcpuOps + ?Sized>(
    out: &mut dyn Write,
    vcpu: &V,
    indent: usize,
) -> Result<(), Error> {
    let regs = vcpu.get_regs().ioctl("KVM_GET_REGS")?;
    let sregs = vcpu.get_sregs().ioctl("KVM_GET_SREGS")?;

    writeln!(out, "{:indent$}vCPU {}:", "", vcpu.id())?;
    writeln!(out, "{:indent$}regs:", "", indent = indent + 2)?;
    regs.dump(out, indent + 4)?;
    writeln!(out, "{:indent$}sregs:", "", indent = indent + 2)?;
    sregs.dump(out, indent + 4)?;
    Ok(())
}

/// Returns the atomic word at `gva` in `vm`.
pub(crate) fn guest_u64<M: GuestMemory>(vm: &GuestVm<M>, gva: u64) -> &AtomicU64 {
    let hva = vm.gva2hva(gva).cast::<AtomicU64>();
    assert!(hva.is_aligned(), "Misaligned guest word at gva: {gva:#x}");
    // Safety: the address is mapped, aligned and `GuestMemory` keeps it valid
    // for the lifetime of `vm`.
    unsafe { &*hva }
}
