//! This module implements the guest GDT with a 64-bit TSS, and the long mode
//! bootstrap of a vCPU that uses them.

use x86::{
    controlregs::{Cr0, Cr4},
    current::paging::BASE_PAGE_SIZE,
};

use super::{
    DEFAULT_CODE_SELECTOR, DEFAULT_DATA_SELECTOR, DEFAULT_GUEST_STACK_VADDR_MIN,
    DEFAULT_STACK_PGS, DEFAULT_TSS_SELECTOR, EFER_LMA, EFER_LME, EFER_NX,
    cpuid::CpuidCache,
    error::{Error, IoctlResultExt},
    platform_ops::{GuestMemory, VcpuOps},
    registers::{DTable, MpState, RFLAGS_FIXED},
    segment::{Segment, SegmentDescriptor},
    vm::GuestVm,
};

/// The GDT limit. The GDT always takes a whole page.
pub const GDT_LIMIT: u16 = (BASE_PAGE_SIZE - 1) as u16;

impl<M: GuestMemory> GuestVm<M> {
    /// Allocates the GDT unless already done. Returns the GDTR value for it.
    pub fn setup_gdt(&mut self) -> DTable {
        let base = match self.gdt {
            Some(gdt) => gdt,
            None => {
                let gdt = self.vaddr_alloc_page();
                log::debug!("GDT allocated at {gdt:#x}");
                self.gdt = Some(gdt);
                gdt
            }
        };
        DTable {
            base,
            limit: GDT_LIMIT,
        }
    }

    /// Writes the descriptor of `segment` into the GDT slot its selector
    /// names. System segments take the following slot too.
    pub fn fill_gdt_64bit(&mut self, segment: &Segment) {
        let gdt = self.setup_gdt().base;
        // Safety: the GDT is a mapped page and any value is a valid u64.
        let table = unsafe { self.page_mut::<u64>(gdt) };
        SegmentDescriptor::from_segment(segment).write_to(table, segment.selector);
    }

    /// Returns the flat code segment for `selector` and writes it to the GDT.
    pub fn kernel_code_segment_64bit(&mut self, selector: u16) -> Segment {
        let segment = Segment::code64(selector);
        self.fill_gdt_64bit(&segment);
        segment
    }

    /// Returns the flat data segment for `selector` and writes it to the GDT.
    pub fn kernel_data_segment_64bit(&mut self, selector: u16) -> Segment {
        let segment = Segment::data64(selector);
        self.fill_gdt_64bit(&segment);
        segment
    }

    /// Allocates the TSS unless already done, and writes its descriptor for
    /// `selector` to the GDT.
    pub fn setup_tss_64bit(&mut self, selector: u16) -> Segment {
        let base = match self.tss {
            Some(tss) => tss,
            None => {
                let tss = self.vaddr_alloc_page();
                log::debug!("TSS allocated at {tss:#x}");
                self.tss = Some(tss);
                tss
            }
        };
        let segment = Segment::tss64(base, selector);
        self.fill_gdt_64bit(&segment);
        segment
    }

    /// Puts `vcpu` into 64-bit mode with paging rooted at this VM's PML4 and
    /// the flat segments of this VM's GDT.
    pub fn setup_vcpu_sregs<V: VcpuOps + ?Sized>(&mut self, vcpu: &mut V) -> Result<(), Error> {
        let mut sregs = vcpu.get_sregs().ioctl("KVM_GET_SREGS")?;

        sregs.idt.limit = 0;
        sregs.gdt = self.setup_gdt();

        sregs.cr0 = (Cr0::CR0_PROTECTED_MODE | Cr0::CR0_NUMERIC_ERROR | Cr0::CR0_ENABLE_PAGING)
            .bits() as u64;
        sregs.cr4 |= (Cr4::CR4_ENABLE_PAE | Cr4::CR4_ENABLE_SSE).bits() as u64;
        sregs.efer |= EFER_LME | EFER_LMA | EFER_NX;

        sregs.ldt = Segment::unusable();
        sregs.cs = self.kernel_code_segment_64bit(DEFAULT_CODE_SELECTOR);
        sregs.ds = self.kernel_data_segment_64bit(DEFAULT_DATA_SELECTOR);
        sregs.es = self.kernel_data_segment_64bit(DEFAULT_DATA_SELECTOR);
        sregs.tr = self.setup_tss_64bit(DEFAULT_TSS_SELECTOR);

        sregs.cr3 = self.pgd_alloc();
        vcpu.set_sregs(&sregs).ioctl("KVM_SET_SREGS")
    }

    /// Makes a freshly created `vcpu` ready to run `guest_code`: installs the
    /// supported CPUID table, enters 64-bit mode and gives it a stack.
    pub fn setup_vcpu<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
        cpuid: &CpuidCache,
        guest_code: u64,
    ) -> Result<(), Error> {
        let stack_size = DEFAULT_STACK_PGS * BASE_PAGE_SIZE;
        let stack = self.vaddr_alloc(DEFAULT_STACK_PGS, DEFAULT_GUEST_STACK_VADDR_MIN);
        log::debug!(
            "vCPU {} stack at {stack:#x}-{:#x}",
            vcpu.id(),
            stack + stack_size as u64
        );

        vcpu.set_cpuid2(cpuid.supported_cpuid()?)
            .ioctl("KVM_SET_CPUID2")?;
        self.setup_vcpu_sregs(vcpu)?;

        let mut regs = vcpu.get_regs().ioctl("KVM_GET_REGS")?;
        regs.rflags |= RFLAGS_FIXED;
        regs.rsp = stack + stack_size as u64;
        regs.rip = guest_code;
        vcpu.set_regs(&regs).ioctl("KVM_SET_REGS")?;

        vcpu.set_mp_state(MpState::RUNNABLE)
            .ioctl("KVM_SET_MP_STATE")
    }
}
