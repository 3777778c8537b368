//! This module implements saving the complete state of a vCPU and loading it
//! back, for example into a vCPU of another VM.

use alloc::{vec, vec::Vec};

use super::{
    NESTED_STATE_MAX_SIZE,
    cpuid::CpuidCache,
    error::{Error, IoctlResultExt},
    platform_ops::{Capability, VcpuOps},
    registers::{DebugRegs, MpState, MsrEntry, Regs, Sregs, VcpuEvents, Xcrs, Xsave},
};

/// Nested virtualization state as an opaque blob.
#[derive(Clone, Debug, PartialEq, Eq, derive_deref::Deref)]
pub struct NestedState(Vec<u8>);

/// A snapshot of everything the hypervisor keeps for a vCPU.
///
/// The snapshot owns all of its buffers; dropping it releases them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuState {
    events: VcpuEvents,
    mp_state: MpState,
    regs: Regs,
    xsave: Xsave,
    xcrs: Option<Xcrs>,
    sregs: Sregs,
    nested: Option<NestedState>,
    msrs: Vec<MsrEntry>,
    debugregs: DebugRegs,
}

impl VcpuState {
    /// Captures the state of `vcpu`.
    ///
    /// Any pending I/O is completed first since register state is undefined
    /// until then.
    pub fn save<V: VcpuOps + ?Sized>(vcpu: &mut V, cpuid: &CpuidCache) -> Result<Self, Error> {
        let msr_list = cpuid.msr_index_list()?;
        let nested_size = cpuid.nested_state_size();

        vcpu.run_complete_io().ioctl("KVM_RUN")?;
        log::debug!("Saving the state of vCPU {}", vcpu.id());

        let events = vcpu.get_events().ioctl("KVM_GET_VCPU_EVENTS")?;
        let mp_state = vcpu.get_mp_state().ioctl("KVM_GET_MP_STATE")?;
        let regs = vcpu.get_regs().ioctl("KVM_GET_REGS")?;
        let xsave = save_xsave(vcpu, cpuid)?;

        let xcrs = if cpuid.has_capability(Capability::Xcrs) {
            Some(vcpu.get_xcrs().ioctl("KVM_GET_XCRS")?)
        } else {
            log::warn!("{} unsupported, XCRs are not saved", Capability::Xcrs);
            None
        };

        let sregs = vcpu.get_sregs().ioctl("KVM_GET_SREGS")?;

        let nested = if nested_size == 0 {
            None
        } else {
            let mut buffer = vec![0u8; NESTED_STATE_MAX_SIZE];
            let size = vcpu
                .get_nested_state(&mut buffer)
                .ioctl("KVM_GET_NESTED_STATE")?;
            assert!(
                size <= nested_size,
                "Nested state size too big, {size} > {nested_size}"
            );
            buffer.truncate(size);
            Some(NestedState(buffer))
        };

        let mut msrs: Vec<MsrEntry> = msr_list.iter().copied().map(MsrEntry::new).collect();
        let processed = vcpu.get_msrs(&mut msrs).ioctl("KVM_GET_MSRS")?;
        check_msr_batch("KVM_GET_MSRS", &msrs, processed)?;

        let debugregs = vcpu.get_debugregs().ioctl("KVM_GET_DEBUGREGS")?;

        Ok(Self {
            events,
            mp_state,
            regs,
            xsave,
            xcrs,
            sregs,
            nested,
            msrs,
            debugregs,
        })
    }

    pub fn events(&self) -> &VcpuEvents {
        &self.events
    }

    pub fn mp_state(&self) -> MpState {
        self.mp_state
    }

    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    pub fn xsave(&self) -> &Xsave {
        &self.xsave
    }

    /// Present only when the hypervisor supports extended control registers.
    pub fn xcrs(&self) -> Option<&Xcrs> {
        self.xcrs.as_ref()
    }

    pub fn sregs(&self) -> &Sregs {
        &self.sregs
    }

    /// Present only when the hypervisor supports nested state.
    pub fn nested(&self) -> Option<&NestedState> {
        self.nested.as_ref()
    }

    /// The MSRs in the order of the save/restore list.
    pub fn msrs(&self) -> &[MsrEntry] {
        &self.msrs
    }

    pub fn debugregs(&self) -> &DebugRegs {
        &self.debugregs
    }

    /// Loads this snapshot into `vcpu`.
    ///
    /// System registers go first as they decide how the rest is interpreted,
    /// and nested state goes last as it depends on all of the others. The
    /// first failure aborts the load.
    pub fn restore<V: VcpuOps + ?Sized>(&self, vcpu: &mut V) -> Result<(), Error> {
        log::debug!("Restoring the state of vCPU {}", vcpu.id());

        vcpu.set_sregs(&self.sregs).ioctl("KVM_SET_SREGS")?;

        let processed = vcpu.set_msrs(&self.msrs).ioctl("KVM_SET_MSRS")?;
        check_msr_batch("KVM_SET_MSRS", &self.msrs, processed)?;

        if let Some(xcrs) = &self.xcrs {
            vcpu.set_xcrs(xcrs).ioctl("KVM_SET_XCRS")?;
        }
        vcpu.set_xsave(&self.xsave).ioctl("KVM_SET_XSAVE")?;
        vcpu.set_events(&self.events).ioctl("KVM_SET_VCPU_EVENTS")?;
        vcpu.set_mp_state(self.mp_state).ioctl("KVM_SET_MP_STATE")?;
        vcpu.set_debugregs(&self.debugregs)
            .ioctl("KVM_SET_DEBUGREGS")?;
        vcpu.set_regs(&self.regs).ioctl("KVM_SET_REGS")?;

        if let Some(nested) = self.nested.as_ref().filter(|nested| !nested.is_empty()) {
            vcpu.set_nested_state(nested).ioctl("KVM_SET_NESTED_STATE")?;
        }
        Ok(())
    }
}

fn save_xsave<V: VcpuOps + ?Sized>(vcpu: &V, cpuid: &CpuidCache) -> Result<Xsave, Error> {
    match usize::try_from(cpuid.capability(Capability::Xsave2)).unwrap_or(0) {
        0 => {
            let mut xsave = Xsave::legacy();
            vcpu.get_xsave(&mut xsave).ioctl("KVM_GET_XSAVE")?;
            Ok(xsave)
        }
        size => {
            let mut xsave = Xsave::with_size(size);
            vcpu.get_xsave2(&mut xsave).ioctl("KVM_GET_XSAVE2")?;
            Ok(xsave)
        }
    }
}

fn check_msr_batch(call: &'static str, msrs: &[MsrEntry], processed: usize) -> Result<(), Error> {
    if processed == msrs.len() {
        return Ok(());
    }
    Err(Error::MsrBatch {
        call,
        index: msrs.get(processed).map_or(0, |msr| msr.index),
        processed,
        total: msrs.len(),
    })
}

/// Reads the MSR `index` of `vcpu`.
pub fn get_msr<V: VcpuOps + ?Sized>(vcpu: &V, index: u32) -> Result<u64, Error> {
    let mut msr = [MsrEntry::new(index)];
    let processed = vcpu.get_msrs(&mut msr).ioctl("KVM_GET_MSRS")?;
    check_msr_batch("KVM_GET_MSRS", &msr, processed)?;
    Ok(msr[0].data)
}

/// Writes `value` to the MSR `index` of `vcpu`. Returns `false` if the
/// hypervisor rejected the value, as it does for values that fault on bare
/// metal.
pub fn try_set_msr<V: VcpuOps + ?Sized>(
    vcpu: &mut V,
    index: u32,
    value: u64,
) -> Result<bool, Error> {
    let processed = vcpu
        .set_msrs(&[MsrEntry { index, data: value }])
        .ioctl("KVM_SET_MSRS")?;
    Ok(processed == 1)
}

/// Writes `value` to the MSR `index` of `vcpu`. The write must succeed.
pub fn set_msr<V: VcpuOps + ?Sized>(vcpu: &mut V, index: u32, value: u64) -> Result<(), Error> {
    let msr = [MsrEntry { index, data: value }];
    let processed = vcpu.set_msrs(&msr).ioctl("KVM_SET_MSRS")?;
    check_msr_batch("KVM_SET_MSRS", &msr, processed)
}
