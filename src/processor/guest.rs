//! Primitives run inside the guest to talk to the host, and their host side
//! counterparts.

use core::arch::asm;

use super::{
    UCALL_PIO_PORT,
    error::{Error, IoctlResultExt},
    platform_ops::{GuestMemory, VcpuExit, VcpuOps},
    vm::GuestVm,
};

pub const UCALL_MAX_ARGS: usize = 6;

/// What a guest asks of the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum UcallCmd {
    None = 0,
    Sync = 1,
    Abort = 2,
    Done = 3,
    /// An exception arrived with no handler installed. The first argument is
    /// the vector.
    Unhandled = 4,
}

/// The record a guest passes to the host, by address in RDI, when accessing
/// [`UCALL_PIO_PORT`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Ucall {
    pub cmd: u64,
    pub args: [u64; UCALL_MAX_ARGS],
}

impl Ucall {
    pub fn new(cmd: UcallCmd, args: &[u64]) -> Self {
        assert!(
            args.len() <= UCALL_MAX_ARGS,
            "Too many ucall arguments: {}",
            args.len()
        );
        let mut uc = Self {
            cmd: cmd as u64,
            args: [0; UCALL_MAX_ARGS],
        };
        uc.args[..args.len()].copy_from_slice(args);
        uc
    }

    /// Returns the decoded command, or `None` for an unknown value.
    pub fn cmd(&self) -> Option<UcallCmd> {
        num_traits::FromPrimitive::from_u64(self.cmd)
    }

    /// Reads the record the guest passed when `vcpu` exited on
    /// [`UCALL_PIO_PORT`], and completes the I/O. Any other exit yields a
    /// record with [`UcallCmd::None`] and leaves the vCPU untouched.
    pub fn from_guest<M: GuestMemory, V: VcpuOps + ?Sized>(
        vm: &GuestVm<M>,
        vcpu: &mut V,
    ) -> Result<Self, Error> {
        if vcpu.exit() != (VcpuExit::Io { port: UCALL_PIO_PORT }) {
            return Ok(Self::default());
        }

        let regs = vcpu.get_regs().ioctl("KVM_GET_REGS")?;
        // Safety: the guest placed a `Ucall` at RDI, which must be mapped.
        let uc = unsafe { vm.gva2hva(regs.rdi).cast::<Self>().read_unaligned() };
        vcpu.run_complete_io().ioctl("KVM_RUN")?;
        log::trace!("ucall from vCPU {}: {uc:x?}", vcpu.id());
        Ok(uc)
    }

    /// Passes this record to the host. Guest only.
    pub fn send(&self) {
        // Safety: the port access exits to the host, which reads the record
        // while it is alive.
        unsafe {
            asm!(
                "in al, dx",
                in("dx") UCALL_PIO_PORT,
                in("rdi") core::ptr::from_ref(self),
                out("al") _,
                options(nostack, preserves_flags),
            );
        }
    }
}

/// Fails the test when `uc` reports an exception the guest did not handle.
pub fn assert_on_unhandled_exception(uc: &Ucall) {
    if uc.cmd() == Some(UcallCmd::Unhandled) {
        panic!(
            "Unexpected vectored event in guest (vector:{:#x})",
            uc.args[0]
        );
    }
}

/// Signals the host. Guest only.
pub fn ucall(cmd: UcallCmd, args: &[u64]) {
    Ucall::new(cmd, args).send();
}

/// Issues a hypercall with VMCALL. Guest only, on Intel processors.
pub fn kvm_hypercall(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64) -> u64 {
    let ret: u64;
    // RBX cannot be named as an operand, so the first argument is swapped in
    // and out around the call.
    unsafe {
        asm!(
            "xchg {a0}, rbx",
            "vmcall",
            "xchg {a0}, rbx",
            a0 = inout(reg) a0 => _,
            inout("rax") nr => ret,
            in("rcx") a1,
            in("rdx") a2,
            in("rsi") a3,
            options(nostack),
        );
    }
    ret
}
