//! This module implements the guest IDT and the routing of guest exceptions
//! to test supplied handlers.

use core::{
    arch::global_asm,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{
    DEFAULT_CODE_SELECTOR, DEFAULT_DATA_SELECTOR, NUM_INTERRUPTS,
    error::{Error, IoctlResultExt},
    guest::{Ucall, UcallCmd},
    platform_ops::{GuestMemory, VcpuOps},
    registers::DTable,
    segment::Segment,
    vm::{GuestVm, guest_u64},
};

/// A handler for a guest exception. Receives the interrupted context and may
/// modify it before the guest resumes.
pub type ExceptionHandler = extern "C" fn(regs: &mut ExRegs);

/// The guest's pointer to its exception handler table. Zero until the host
/// publishes the table.
pub static EXCEPTION_HANDLERS: AtomicU64 = AtomicU64::new(0);

/// The IDT limit for [`NUM_INTERRUPTS`] gates.
pub const IDT_LIMIT: u16 = (NUM_INTERRUPTS * size_of::<InterruptDescriptorTableEntry>() - 1) as u16;

#[derive(Debug)]
#[repr(C, align(4096))]
pub struct InterruptDescriptorTableRaw([InterruptDescriptorTableEntry; NUM_INTERRUPTS]);
const _: () = assert!(core::mem::size_of::<InterruptDescriptorTableRaw>() == 4096);

/// An interrupt gate. See: 6.14.1 64-Bit Mode IDT
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct InterruptDescriptorTableEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_high: u16,
    offset_upper: u32,
    reserved: u32,
}
const _: () = assert!(core::mem::size_of::<InterruptDescriptorTableEntry>() == 16);

impl InterruptDescriptorTableEntry {
    const PRESENT: u8 = 1 << 7;
    const INTERRUPT_GATE: u8 = 0b1110;

    pub fn new(handler: u64, dpl: u8, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr: Self::PRESENT | (dpl & 0b11) << 5 | Self::INTERRUPT_GATE,
            offset_high: (handler >> 16) as u16,
            offset_upper: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.offset_low)
            | u64::from(self.offset_high) << 16
            | u64::from(self.offset_upper) << 32
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn dpl(&self) -> u8 {
        (self.type_attr >> 5) & 0b11
    }

    pub fn present(&self) -> bool {
        self.type_attr & Self::PRESENT != 0
    }

    pub fn gate_type(&self) -> u8 {
        self.type_attr & 0xf
    }
}

/// The layout of the stack the trampolines pass to `route_exception`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ExRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub vector: u64,     // Software saved (see idt_handlers.S)
    pub error_code: u64, // Software or hardware saved (see idt_handlers.S)
    pub rip: u64,        // Hardware saved
    pub cs: u64,         // Hardware saved
    pub rflags: u64,     // Hardware saved
    pub rsp: u64,        // Hardware saved
    pub ss: u64,         // Hardware saved
}

/// Returns the address of the trampoline for `vector`. Each trampoline is 16
/// byte long and can be located from asm_idt_handler0.
pub fn idt_handler_address(vector: u8) -> u64 {
    (asm_idt_handler0 as usize + 0x10 * usize::from(vector)) as u64
}

/// Runs the handler `handlers` registers for the vector in `regs`. Returns the
/// signal for the host when there is none.
pub(crate) fn dispatch(
    handlers: Option<&[u64; NUM_INTERRUPTS]>,
    regs: &mut ExRegs,
) -> Option<Ucall> {
    let handler = handlers
        .and_then(|handlers| handlers.get(regs.vector as usize))
        .copied()
        .filter(|&handler| handler != 0);

    match handler {
        Some(handler) => {
            // Safety: non-zero slots are only written from `ExceptionHandler`
            // values.
            let handler: ExceptionHandler = unsafe { core::mem::transmute(handler as usize) };
            handler(regs);
            None
        }
        None => Some(Ucall::new(UcallCmd::Unhandled, &[regs.vector])),
    }
}

/// The guest exception handler. Called by the trampolines with the saved
/// context.
///
/// # Safety
///
/// `regs` must point to the context the trampoline saved on the current
/// stack.
#[unsafe(no_mangle)]
pub(crate) unsafe extern "C" fn route_exception(regs: *mut ExRegs) {
    assert!(!regs.is_null());
    let regs = unsafe { &mut *regs };
    let table = EXCEPTION_HANDLERS.load(Ordering::Acquire) as *const [u64; NUM_INTERRUPTS];
    // Safety: the host publishes either nothing or a mapped handler page.
    let handlers = unsafe { table.as_ref() };
    if let Some(uc) = dispatch(handlers, regs) {
        uc.send();
    }
}

impl<M: GuestMemory> GuestVm<M> {
    /// Allocates the IDT and the exception handler table, pointing every gate
    /// at its trampoline.
    pub fn init_descriptor_tables(&mut self) {
        let idt = self.vaddr_alloc_page();
        let handlers = self.vaddr_alloc_page();
        log::debug!("IDT allocated at {idt:#x}, exception handlers at {handlers:#x}");
        self.idt = Some(idt);
        self.handlers = Some(handlers);

        // Trampolines have the same address in the host and the guest.
        for vector in 0..=u8::MAX {
            self.set_idt_entry(vector, idt_handler_address(vector), 0, DEFAULT_CODE_SELECTOR);
        }
    }

    fn idt_table(&mut self) -> &mut InterruptDescriptorTableRaw {
        let idt = self
            .idt
            .unwrap_or_else(|| panic!("IDT not initialized"));
        // Safety: the IDT is a mapped page and every bit pattern is a valid
        // entry.
        unsafe { &mut *self.gva2hva(idt).cast::<InterruptDescriptorTableRaw>() }
    }

    /// Points the gate for `vector` at `handler`.
    pub fn set_idt_entry(&mut self, vector: u8, handler: u64, dpl: u8, selector: u16) {
        self.idt_table().0[usize::from(vector)] =
            InterruptDescriptorTableEntry::new(handler, dpl, selector);
    }

    pub fn idt_entry(&mut self, vector: u8) -> InterruptDescriptorTableEntry {
        self.idt_table().0[usize::from(vector)]
    }

    /// Loads this VM's IDT and GDT into `vcpu` and publishes the exception
    /// handler table to the guest.
    pub fn init_vcpu_descriptor_tables<V: VcpuOps + ?Sized>(
        &mut self,
        vcpu: &mut V,
    ) -> Result<(), Error> {
        let (Some(idt), Some(handlers)) = (self.idt, self.handlers) else {
            panic!("Descriptor tables not initialized");
        };

        let mut sregs = vcpu.get_sregs().ioctl("KVM_GET_SREGS")?;
        sregs.idt = DTable {
            base: idt,
            limit: IDT_LIMIT,
        };
        sregs.gdt = self.setup_gdt();
        sregs.gs = Segment::data64(DEFAULT_DATA_SELECTOR);
        vcpu.set_sregs(&sregs).ioctl("KVM_SET_SREGS")?;

        guest_u64(self, self.handlers_pointer()).store(handlers, Ordering::Release);
        Ok(())
    }

    /// Registers `handler` for `vector`, or restores the default when `None`.
    pub fn install_exception_handler(&mut self, vector: u8, handler: Option<ExceptionHandler>) {
        let handlers = self
            .handlers
            .unwrap_or_else(|| panic!("Exception handler table not initialized"));
        // Safety: the handler table is a mapped page and any value is a valid
        // u64.
        let table = unsafe { self.page_mut::<u64>(handlers) };
        table[usize::from(vector)] = handler.map_or(0, |handler| handler as usize as u64);
    }
}

global_asm!(include_str!("idt_handlers.S"));
unsafe extern "C" {
    unsafe fn asm_idt_handler0();
}
