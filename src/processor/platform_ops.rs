//! The interfaces the hypervisor control channel and the guest memory manager
//! provide to this crate.

use super::{
    error::IoctlError,
    registers::{
        CpuidEntry, DebugRegs, MpState, MsrEntry, Regs, Sregs, VcpuEvents, Xcrs, Xsave,
    },
};

/// Optional hypervisor extensions this crate queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Capability {
    /// Returns the size in bytes of the extended save area when supported.
    #[display("KVM_CAP_XSAVE2")]
    Xsave2,

    #[display("KVM_CAP_XCRS")]
    Xcrs,

    /// Returns the maximum size in bytes of the nested state when supported.
    #[display("KVM_CAP_NESTED_STATE")]
    NestedState,
}

/// Which of the two MSR index lists to enumerate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum MsrListKind {
    /// MSRs that are part of the vCPU state and saved on suspend.
    #[display("KVM_GET_MSR_INDEX_LIST")]
    SaveRestore,

    /// Read-only MSRs describing hypervisor features.
    #[display("KVM_GET_MSR_FEATURE_INDEX_LIST")]
    Feature,
}

/// Why the last run of a vCPU returned to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VcpuExit {
    /// The vCPU has not run yet.
    #[default]
    None,

    /// The guest accessed an I/O port.
    Io { port: u16 },

    Hlt,

    /// Any other exit, by the hypervisor's exit reason number.
    Other(u32),
}

/// System-wide queries against the hypervisor.
///
/// The list enumerating methods follow a two-call protocol: when `entries` is
/// too small, they fail with [`IoctlError::TooBig`] carrying the required
/// count, otherwise they fill `entries` and return the count written.
pub trait HypervisorOps: Send + Sync {
    /// Returns 0 if `cap` is unsupported, otherwise a capability specific
    /// non-zero value.
    fn check_extension(&self, cap: Capability) -> u64;

    fn get_supported_cpuid(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError>;

    fn get_supported_hv_cpuid(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError>;

    fn get_msr_index_list(
        &self,
        kind: MsrListKind,
        indices: &mut [u32],
    ) -> Result<usize, IoctlError>;

    /// Reads the feature MSRs named by the `index` of each entry. Returns the
    /// number of entries read, which stops at the first unknown index.
    fn get_feature_msrs(&self, entries: &mut [MsrEntry]) -> Result<usize, IoctlError>;

    /// Reads a system device attribute.
    fn get_device_attr(&self, group: u32, attr: u64) -> Result<u64, IoctlError>;
}

/// Per-vCPU accessors.
pub trait VcpuOps {
    fn id(&self) -> u32;

    /// Returns the reason of the last exit.
    fn exit(&self) -> VcpuExit;

    /// Completes a pending I/O exit so that the register state is consistent.
    fn run_complete_io(&mut self) -> Result<(), IoctlError>;

    fn get_regs(&self) -> Result<Regs, IoctlError>;
    fn set_regs(&mut self, regs: &Regs) -> Result<(), IoctlError>;

    fn get_sregs(&self) -> Result<Sregs, IoctlError>;
    fn set_sregs(&mut self, sregs: &Sregs) -> Result<(), IoctlError>;

    fn get_events(&self) -> Result<VcpuEvents, IoctlError>;
    fn set_events(&mut self, events: &VcpuEvents) -> Result<(), IoctlError>;

    fn get_mp_state(&self) -> Result<MpState, IoctlError>;
    fn set_mp_state(&mut self, mp_state: MpState) -> Result<(), IoctlError>;

    fn get_debugregs(&self) -> Result<DebugRegs, IoctlError>;
    fn set_debugregs(&mut self, debugregs: &DebugRegs) -> Result<(), IoctlError>;

    fn get_xcrs(&self) -> Result<Xcrs, IoctlError>;
    fn set_xcrs(&mut self, xcrs: &Xcrs) -> Result<(), IoctlError>;

    /// Reads the legacy, fixed size extended state area.
    fn get_xsave(&self, xsave: &mut Xsave) -> Result<(), IoctlError>;

    /// Reads the extended state area sized by [`Capability::Xsave2`].
    fn get_xsave2(&self, xsave: &mut Xsave) -> Result<(), IoctlError>;

    fn set_xsave(&mut self, xsave: &Xsave) -> Result<(), IoctlError>;

    /// Reads the MSRs named by the `index` of each entry. Returns the number
    /// of entries processed, which stops at the first failing index.
    fn get_msrs(&self, entries: &mut [MsrEntry]) -> Result<usize, IoctlError>;

    /// Writes `entries` in order. Returns the number of entries processed.
    fn set_msrs(&mut self, entries: &[MsrEntry]) -> Result<usize, IoctlError>;

    /// Reads the nested virtualization state into `buffer`. Returns the size
    /// of the state written.
    fn get_nested_state(&self, buffer: &mut [u8]) -> Result<usize, IoctlError>;
    fn set_nested_state(&mut self, state: &[u8]) -> Result<(), IoctlError>;

    /// Reads the vCPU's CPUID table using the two-call protocol described in
    /// [`HypervisorOps`].
    fn get_cpuid2(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError>;
    fn set_cpuid2(&mut self, entries: &[CpuidEntry]) -> Result<(), IoctlError>;
}

/// Guest physical memory and guest virtual address space bookkeeping.
///
/// # Safety
///
/// [`GuestMemory::gpa2hva`] must return a host pointer valid for reads and
/// writes up to the end of the page containing `gpa`, and page aligned
/// physical addresses must translate into page aligned host addresses. The
/// pointer must stay valid for as long as the implementor is alive.
pub unsafe trait GuestMemory {
    /// Returns the highest guest frame number the guest may use.
    fn max_gfn(&self) -> u64;

    /// Tests whether the virtual page number `vpn` lies within the guest's
    /// usable virtual address range.
    fn is_vpage_valid(&self, vpn: u64) -> bool;

    /// Allocates `count` contiguous zero-filled physical pages and returns
    /// the guest physical address of the first one.
    fn alloc_pages(&mut self, count: usize) -> u64;

    /// Allocates one page for a paging structure.
    fn alloc_page_table(&mut self) -> u64 {
        self.alloc_pages(1)
    }

    /// Reserves `count` unused virtual pages at or above `min_gva` and returns
    /// the first address.
    fn reserve_vaddr(&mut self, count: usize, min_gva: u64) -> u64;

    fn gpa2hva(&self, gpa: u64) -> *mut u8;

    fn hva2gpa(&self, hva: *const u8) -> u64;
}
