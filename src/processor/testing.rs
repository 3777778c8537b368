//! In-memory stand-ins for the hypervisor and the guest memory manager.

use alloc::{
    alloc::handle_alloc_error,
    boxed::Box,
    collections::BTreeMap,
    vec::Vec,
};
use core::{
    alloc::Layout,
    cell::{RefCell, UnsafeCell},
    ops::Range,
};
use std::sync::Mutex;
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

use super::{
    error::IoctlError,
    platform_ops::{Capability, GuestMemory, HypervisorOps, MsrListKind, VcpuExit, VcpuOps},
    registers::{
        CpuidEntry, DebugRegs, MpState, MsrEntry, Regs, Sregs, VcpuEvents, Xcrs, Xsave,
    },
};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Returns zero-initialized Box of `T` without using stack during construction.
pub(crate) fn zeroed_box<T>() -> Box<T> {
    let layout = Layout::new::<T>();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    unsafe { Box::from_raw(ptr) }
}

/// The structure representing a single memory page (4KB).
#[repr(C, align(4096))]
pub(crate) struct Page(UnsafeCell<[u8; BASE_PAGE_SIZE]>);

/// The first guest frame handed out, so that allocations do not overlap the
/// low addresses tests map explicitly.
const FIRST_GFN: u64 = 0x100;

/// Guest memory backed by individually allocated host pages.
pub(crate) struct MockMemory {
    pages: Vec<Box<Page>>,
    valid_vpages: Vec<Range<u64>>,
    reserved_vpages: Vec<Range<u64>>,
    max_gfn: u64,
}

impl MockMemory {
    /// Memory with the whole lower canonical half usable and 40-bit guest
    /// physical addresses.
    pub(crate) fn new() -> Self {
        Self {
            pages: Vec::new(),
            valid_vpages: vec![0..1 << (47 - BASE_PAGE_SHIFT)],
            reserved_vpages: Vec::new(),
            max_gfn: (1 << (40 - BASE_PAGE_SHIFT)) - 1,
        }
    }

    /// Makes every virtual page number valid, canonical or not.
    pub(crate) fn allow_all_vpages(&mut self) {
        self.valid_vpages = vec![0..u64::MAX];
    }

    pub(crate) fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

unsafe impl GuestMemory for MockMemory {
    fn max_gfn(&self) -> u64 {
        self.max_gfn
    }

    fn is_vpage_valid(&self, vpn: u64) -> bool {
        self.valid_vpages.iter().any(|range| range.contains(&vpn))
    }

    fn alloc_pages(&mut self, count: usize) -> u64 {
        let gpa = (FIRST_GFN + self.pages.len() as u64) << BASE_PAGE_SHIFT;
        self.pages.extend((0..count).map(|_| zeroed_box::<Page>()));
        gpa
    }

    fn reserve_vaddr(&mut self, count: usize, min_gva: u64) -> u64 {
        let count = count as u64;
        let mut vpn = min_gva.div_ceil(BASE_PAGE_SIZE as u64);
        loop {
            let candidate = vpn..vpn + count;
            assert!(
                self.is_vpage_valid(candidate.end - 1),
                "No virtual address space left at or above {min_gva:#x}"
            );
            match self
                .reserved_vpages
                .iter()
                .find(|reserved| reserved.start < candidate.end && candidate.start < reserved.end)
            {
                Some(reserved) => vpn = reserved.end,
                None => {
                    self.reserved_vpages.push(candidate);
                    return vpn << BASE_PAGE_SHIFT;
                }
            }
        }
    }

    fn gpa2hva(&self, gpa: u64) -> *mut u8 {
        let index = (gpa >> BASE_PAGE_SHIFT)
            .checked_sub(FIRST_GFN)
            .and_then(|index| self.pages.get(index as usize))
            .unwrap_or_else(|| panic!("No guest physical memory at {gpa:#x}"));
        let offset = (gpa as usize) & (BASE_PAGE_SIZE - 1);
        index.0.get().cast::<u8>().wrapping_add(offset)
    }

    fn hva2gpa(&self, hva: *const u8) -> u64 {
        let addr = hva as usize;
        self.pages
            .iter()
            .enumerate()
            .find_map(|(index, page)| {
                let base = page.0.get() as usize;
                (base..base + BASE_PAGE_SIZE).contains(&addr).then(|| {
                    ((FIRST_GFN + index as u64) << BASE_PAGE_SHIFT) + (addr - base) as u64
                })
            })
            .unwrap_or_else(|| panic!("No guest physical memory at {hva:p}"))
    }
}

/// Copies `source` into `entries` following the two-call protocol.
fn fill<T: Clone>(source: &[T], entries: &mut [T]) -> Result<usize, IoctlError> {
    if entries.len() < source.len() {
        return Err(IoctlError::TooBig {
            required: source.len(),
        });
    }
    entries[..source.len()].clone_from_slice(source);
    Ok(source.len())
}

#[derive(Default)]
pub(crate) struct MockHypervisor {
    pub(crate) caps: Vec<(Capability, u64)>,
    pub(crate) cpuid: Vec<CpuidEntry>,
    pub(crate) hv_cpuid: Vec<CpuidEntry>,
    pub(crate) msr_indices: Vec<u32>,
    pub(crate) feature_msr_indices: Vec<u32>,
    pub(crate) feature_msrs: Vec<MsrEntry>,
    pub(crate) xcomp_guest_supp: Option<u64>,
    /// Reports one entry fewer on the filling call of the MSR index list.
    pub(crate) shrink_msr_list_after_probe: bool,
    /// The number of enumeration calls to fail before succeeding.
    pub(crate) fail_probes: usize,
    pub(crate) probes: Mutex<Vec<&'static str>>,
}

impl MockHypervisor {
    fn record(&self, call: &'static str) -> Result<(), IoctlError> {
        let mut probes = self.probes.lock().unwrap();
        probes.push(call);
        if probes.len() <= self.fail_probes {
            Err(IoctlError::Errno(5))
        } else {
            Ok(())
        }
    }

    pub(crate) fn probe_count(&self, call: &str) -> usize {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter(|probe| **probe == call)
            .count()
    }
}

impl HypervisorOps for MockHypervisor {
    fn check_extension(&self, cap: Capability) -> u64 {
        self.caps
            .iter()
            .find(|(supported, _)| *supported == cap)
            .map_or(0, |(_, value)| *value)
    }

    fn get_supported_cpuid(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError> {
        self.record("KVM_GET_SUPPORTED_CPUID")?;
        fill(&self.cpuid, entries)
    }

    fn get_supported_hv_cpuid(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError> {
        self.record("KVM_GET_SUPPORTED_HV_CPUID")?;
        fill(&self.hv_cpuid, entries)
    }

    fn get_msr_index_list(
        &self,
        kind: MsrListKind,
        indices: &mut [u32],
    ) -> Result<usize, IoctlError> {
        match kind {
            MsrListKind::SaveRestore => {
                self.record("KVM_GET_MSR_INDEX_LIST")?;
                let count = fill(&self.msr_indices, indices)?;
                if self.shrink_msr_list_after_probe && !indices.is_empty() {
                    Ok(count - 1)
                } else {
                    Ok(count)
                }
            }
            MsrListKind::Feature => {
                self.record("KVM_GET_MSR_FEATURE_INDEX_LIST")?;
                fill(&self.feature_msr_indices, indices)
            }
        }
    }

    fn get_feature_msrs(&self, entries: &mut [MsrEntry]) -> Result<usize, IoctlError> {
        for (processed, entry) in entries.iter_mut().enumerate() {
            match self.feature_msrs.iter().find(|msr| msr.index == entry.index) {
                Some(msr) => entry.data = msr.data,
                None => return Ok(processed),
            }
        }
        Ok(entries.len())
    }

    fn get_device_attr(&self, _group: u32, _attr: u64) -> Result<u64, IoctlError> {
        self.xcomp_guest_supp.ok_or(IoctlError::Unsupported)
    }
}

/// A vCPU whose state is plain fields. Every accessor call is recorded under
/// the name of the corresponding control interface call.
#[derive(Default)]
pub(crate) struct MockVcpu {
    pub(crate) id: u32,
    pub(crate) exit: VcpuExit,
    pub(crate) regs: Regs,
    pub(crate) sregs: Sregs,
    pub(crate) events: VcpuEvents,
    pub(crate) mp_state: MpState,
    pub(crate) debugregs: DebugRegs,
    pub(crate) xcrs: Xcrs,
    pub(crate) xsave: Vec<u32>,
    pub(crate) msrs: BTreeMap<u32, u64>,
    /// MSRs writes are accepted for. Any MSR when empty.
    pub(crate) known_msrs: Vec<u32>,
    pub(crate) nested: Vec<u8>,
    pub(crate) cpuid: Vec<CpuidEntry>,
    pub(crate) fail_on: Option<&'static str>,
    calls: RefCell<Vec<&'static str>>,
}

impl MockVcpu {
    fn call(&self, name: &'static str) -> Result<(), IoctlError> {
        self.calls.borrow_mut().push(name);
        if self.fail_on == Some(name) {
            Err(IoctlError::Errno(22))
        } else {
            Ok(())
        }
    }

    /// The calls made so far, oldest first.
    pub(crate) fn log(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn read_xsave(&self, xsave: &mut Xsave) {
        let region = xsave.region_mut();
        let len = region.len().min(self.xsave.len());
        region[..len].copy_from_slice(&self.xsave[..len]);
    }
}

impl VcpuOps for MockVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn exit(&self) -> VcpuExit {
        self.exit
    }

    fn run_complete_io(&mut self) -> Result<(), IoctlError> {
        self.call("KVM_RUN")
    }

    fn get_regs(&self) -> Result<Regs, IoctlError> {
        self.call("KVM_GET_REGS")?;
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &Regs) -> Result<(), IoctlError> {
        self.call("KVM_SET_REGS")?;
        self.regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<Sregs, IoctlError> {
        self.call("KVM_GET_SREGS")?;
        Ok(self.sregs)
    }

    fn set_sregs(&mut self, sregs: &Sregs) -> Result<(), IoctlError> {
        self.call("KVM_SET_SREGS")?;
        self.sregs = *sregs;
        Ok(())
    }

    fn get_events(&self) -> Result<VcpuEvents, IoctlError> {
        self.call("KVM_GET_VCPU_EVENTS")?;
        Ok(self.events)
    }

    fn set_events(&mut self, events: &VcpuEvents) -> Result<(), IoctlError> {
        self.call("KVM_SET_VCPU_EVENTS")?;
        self.events = *events;
        Ok(())
    }

    fn get_mp_state(&self) -> Result<MpState, IoctlError> {
        self.call("KVM_GET_MP_STATE")?;
        Ok(self.mp_state)
    }

    fn set_mp_state(&mut self, mp_state: MpState) -> Result<(), IoctlError> {
        self.call("KVM_SET_MP_STATE")?;
        self.mp_state = mp_state;
        Ok(())
    }

    fn get_debugregs(&self) -> Result<DebugRegs, IoctlError> {
        self.call("KVM_GET_DEBUGREGS")?;
        Ok(self.debugregs)
    }

    fn set_debugregs(&mut self, debugregs: &DebugRegs) -> Result<(), IoctlError> {
        self.call("KVM_SET_DEBUGREGS")?;
        self.debugregs = *debugregs;
        Ok(())
    }

    fn get_xcrs(&self) -> Result<Xcrs, IoctlError> {
        self.call("KVM_GET_XCRS")?;
        Ok(self.xcrs.clone())
    }

    fn set_xcrs(&mut self, xcrs: &Xcrs) -> Result<(), IoctlError> {
        self.call("KVM_SET_XCRS")?;
        self.xcrs = xcrs.clone();
        Ok(())
    }

    fn get_xsave(&self, xsave: &mut Xsave) -> Result<(), IoctlError> {
        self.call("KVM_GET_XSAVE")?;
        self.read_xsave(xsave);
        Ok(())
    }

    fn get_xsave2(&self, xsave: &mut Xsave) -> Result<(), IoctlError> {
        self.call("KVM_GET_XSAVE2")?;
        self.read_xsave(xsave);
        Ok(())
    }

    fn set_xsave(&mut self, xsave: &Xsave) -> Result<(), IoctlError> {
        self.call("KVM_SET_XSAVE")?;
        self.xsave = xsave.region().to_vec();
        Ok(())
    }

    fn get_msrs(&self, entries: &mut [MsrEntry]) -> Result<usize, IoctlError> {
        self.call("KVM_GET_MSRS")?;
        for (processed, entry) in entries.iter_mut().enumerate() {
            match self.msrs.get(&entry.index) {
                Some(data) => entry.data = *data,
                None => return Ok(processed),
            }
        }
        Ok(entries.len())
    }

    fn set_msrs(&mut self, entries: &[MsrEntry]) -> Result<usize, IoctlError> {
        self.call("KVM_SET_MSRS")?;
        for (processed, entry) in entries.iter().enumerate() {
            if !self.known_msrs.is_empty() && !self.known_msrs.contains(&entry.index) {
                return Ok(processed);
            }
            let _ = self.msrs.insert(entry.index, entry.data);
        }
        Ok(entries.len())
    }

    fn get_nested_state(&self, buffer: &mut [u8]) -> Result<usize, IoctlError> {
        self.call("KVM_GET_NESTED_STATE")?;
        fill(&self.nested, buffer)
    }

    fn set_nested_state(&mut self, state: &[u8]) -> Result<(), IoctlError> {
        self.call("KVM_SET_NESTED_STATE")?;
        self.nested = state.to_vec();
        Ok(())
    }

    fn get_cpuid2(&self, entries: &mut [CpuidEntry]) -> Result<usize, IoctlError> {
        fill(&self.cpuid, entries)
    }

    fn set_cpuid2(&mut self, entries: &[CpuidEntry]) -> Result<(), IoctlError> {
        self.call("KVM_SET_CPUID2")?;
        self.cpuid = entries.to_vec();
        Ok(())
    }
}
