//! The process-wide cache of what the hypervisor and the host processor
//! support: the supported CPUID table, the MSR index lists and the nested
//! state size.

use alloc::{format, sync::Arc, vec, vec::Vec};
use bit_field::BitField;
use spin::Once;
use x86::cpuid::{CpuId, cpuid};

use super::{
    NESTED_STATE_MAX_SIZE,
    error::{Error, IoctlError, IoctlResultExt},
    platform_ops::{Capability, HypervisorOps, MsrListKind, VcpuOps},
    registers::{CpuidEntry, MsrEntry},
};

/// A list of MSR indices, in the order the hypervisor reported them.
#[derive(Clone, Debug, Default, PartialEq, Eq, derive_deref::Deref)]
pub struct MsrIndexList(Vec<u32>);

/// A CPUID table. Lookups are by `(function, index)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, derive_deref::Deref)]
pub struct CpuidList(Vec<CpuidEntry>);

impl CpuidList {
    pub fn new(entries: Vec<CpuidEntry>) -> Self {
        Self(entries)
    }

    /// Returns the entry for `(function, index)`, if present.
    pub fn entry(&self, function: u32, index: u32) -> Option<&CpuidEntry> {
        self.0
            .iter()
            .find(|entry| entry.function == function && entry.index == index)
    }

    /// Returns the entry for `(function, index)`. The entry must exist.
    pub fn find_entry(&self, function: u32, index: u32) -> &CpuidEntry {
        self.entry(function, index).unwrap_or_else(|| {
            panic!("CPUID function {function:#x} index {index:#x} not found")
        })
    }

    /// Replaces the entry with the same `(function, index)` as `new`. The entry
    /// must exist.
    pub fn replace_entry(&mut self, new: CpuidEntry) {
        let entry = self
            .0
            .iter_mut()
            .find(|entry| entry.function == new.function && entry.index == new.index)
            .unwrap_or_else(|| {
                panic!(
                    "CPUID function {:#x} index {:#x} not found",
                    new.function, new.index
                )
            });
        *entry = new;
    }

    pub fn into_inner(self) -> Vec<CpuidEntry> {
        self.0
    }
}

/// The register of a CPUID leaf holding a feature bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuidReg {
    Eax,
    Ebx,
    Ecx,
    Edx,
}

/// A single CPUID feature bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[display("{name}")]
pub struct CpuFeature {
    pub name: &'static str,
    pub function: u32,
    pub index: u32,
    pub reg: CpuidReg,
    pub bit: u8,
}

impl CpuFeature {
    const fn new(name: &'static str, function: u32, index: u32, reg: CpuidReg, bit: u8) -> Self {
        Self {
            name,
            function,
            index,
            reg,
            bit,
        }
    }

    pub const VMX: Self = Self::new("VMX", 0x1, 0, CpuidReg::Ecx, 5);
    pub const XSAVE: Self = Self::new("XSAVE", 0x1, 0, CpuidReg::Ecx, 26);
    pub const OSXSAVE: Self = Self::new("OSXSAVE", 0x1, 0, CpuidReg::Ecx, 27);
    pub const PAE: Self = Self::new("PAE", 0x1, 0, CpuidReg::Edx, 6);
    pub const XFD: Self = Self::new("XFD", 0xd, 1, CpuidReg::Eax, 4);
    pub const SVM: Self = Self::new("SVM", 0x8000_0001, 0, CpuidReg::Ecx, 2);
    pub const NX: Self = Self::new("NX", 0x8000_0001, 0, CpuidReg::Edx, 20);

    /// Tests whether the feature bit is set in `entry`.
    pub fn is_set_in(&self, entry: &CpuidEntry) -> bool {
        let value = match self.reg {
            CpuidReg::Eax => entry.eax,
            CpuidReg::Ebx => entry.ebx,
            CpuidReg::Ecx => entry.ecx,
            CpuidReg::Edx => entry.edx,
        };
        value.get_bit(usize::from(self.bit))
    }
}

/// Physical and linear address widths in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressWidth {
    pub pa_bits: u32,
    pub va_bits: u32,
}

/// Device attribute group of the system device.
pub const KVM_X86_GRP_CPU: u32 = 0;

/// Device attribute reporting the XSAVE features the hypervisor may expose to
/// guests.
pub const KVM_X86_XCOMP_GUEST_SUPP: u64 = 0;

/// Runs the two-call enumeration protocol: size the list with an empty buffer,
/// then fill a buffer of exactly that size. The count must not change between
/// the calls.
pub(crate) fn probe_list<T: Clone + Default>(
    call: &'static str,
    mut enumerate: impl FnMut(&mut [T]) -> Result<usize, IoctlError>,
) -> Result<Vec<T>, Error> {
    let required = match enumerate(&mut []) {
        Err(IoctlError::TooBig { required }) => required,
        Ok(0) => {
            log::warn!("{call} reported no entries");
            return Ok(Vec::new());
        }
        Ok(count) => panic!("{call} reported {count} entries in an empty buffer"),
        Err(source) => return Err(Error::Ioctl { call, source }),
    };

    let mut entries = vec![T::default(); required];
    let count = enumerate(&mut entries).ioctl(call)?;
    assert!(
        count == required,
        "Number of entries in {call} changed, was: {required} now: {count}"
    );
    Ok(entries)
}

/// Reads the CPUID table currently installed in `vcpu`.
pub fn vcpu_cpuid<V: VcpuOps + ?Sized>(vcpu: &V) -> Result<CpuidList, Error> {
    probe_list("KVM_GET_CPUID2", |entries| vcpu.get_cpuid2(entries)).map(CpuidList)
}

/// Lazily populated, process-wide hypervisor information.
///
/// Each list is probed on first use and kept until the cache is dropped. A
/// failed probe is not cached; the next access retries.
pub struct CpuidCache {
    ops: Arc<dyn HypervisorOps>,
    supported_cpuid: Once<CpuidList>,
    hv_cpuid: Once<CpuidList>,
    hv_cpuid_full: Once<CpuidList>,
    msr_index_list: Once<MsrIndexList>,
    feature_msr_index_list: Once<MsrIndexList>,
    nested_state_size: Once<usize>,
}

impl core::fmt::Debug for CpuidCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuidCache")
            .field("supported_cpuid", &self.supported_cpuid.get())
            .field("msr_index_list", &self.msr_index_list.get())
            .field("nested_state_size", &self.nested_state_size.get())
            .finish_non_exhaustive()
    }
}

impl CpuidCache {
    pub fn new(ops: Arc<dyn HypervisorOps>) -> Self {
        Self {
            ops,
            supported_cpuid: Once::new(),
            hv_cpuid: Once::new(),
            hv_cpuid_full: Once::new(),
            msr_index_list: Once::new(),
            feature_msr_index_list: Once::new(),
            nested_state_size: Once::new(),
        }
    }

    pub fn ops(&self) -> &dyn HypervisorOps {
        self.ops.as_ref()
    }

    /// Returns the capability specific value of `cap`, 0 if unsupported.
    pub fn capability(&self, cap: Capability) -> u64 {
        self.ops.check_extension(cap)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capability(cap) != 0
    }

    /// Fails with [`Error::Unsupported`] unless `cap` is available.
    pub fn require_capability(&self, cap: Capability) -> Result<u64, Error> {
        match self.capability(cap) {
            0 => Err(Error::Unsupported(format!("{cap}"))),
            value => Ok(value),
        }
    }

    /// Returns the CPUID table the hypervisor supports for guests.
    pub fn supported_cpuid(&self) -> Result<&CpuidList, Error> {
        self.supported_cpuid.try_call_once(|| {
            let entries = probe_list("KVM_GET_SUPPORTED_CPUID", |entries| {
                self.ops.get_supported_cpuid(entries)
            })?;
            log::debug!("{} supported CPUID entries", entries.len());
            Ok(CpuidList(entries))
        })
    }

    /// Returns the supported entry for `(function, index)`. The entry must
    /// exist.
    pub fn supported_entry(&self, function: u32, index: u32) -> Result<&CpuidEntry, Error> {
        Ok(self.supported_cpuid()?.find_entry(function, index))
    }

    /// Returns the hypervisor-interface CPUID leaves.
    pub fn hv_cpuid(&self) -> Result<&CpuidList, Error> {
        self.hv_cpuid.try_call_once(|| {
            probe_list("KVM_GET_SUPPORTED_HV_CPUID", |entries| {
                self.ops.get_supported_hv_cpuid(entries)
            })
            .map(CpuidList)
        })
    }

    /// Returns the supported CPUID table with the hypervisor-interface leaves
    /// merged in. Entries of the supported table in the hypervisor range are
    /// replaced, not duplicated.
    pub fn hv_cpuid_full(&self) -> Result<&CpuidList, Error> {
        const HV_CPUID_RANGE: core::ops::Range<u32> = 0x4000_0000..0x4000_0100;

        self.hv_cpuid_full.try_call_once(|| {
            let mut entries: Vec<CpuidEntry> = self
                .supported_cpuid()?
                .iter()
                .filter(|entry| !HV_CPUID_RANGE.contains(&entry.function))
                .copied()
                .collect();
            entries.extend(self.hv_cpuid()?.iter().copied());
            Ok(CpuidList(entries))
        })
    }

    /// Returns the MSRs that make up the vCPU state.
    pub fn msr_index_list(&self) -> Result<&MsrIndexList, Error> {
        self.msr_index_list.try_call_once(|| {
            let kind = MsrListKind::SaveRestore;
            let list = probe_list("KVM_GET_MSR_INDEX_LIST", |indices| {
                self.ops.get_msr_index_list(kind, indices)
            })?;
            log::debug!("{} MSRs in {kind}", list.len());
            Ok(MsrIndexList(list))
        })
    }

    /// Returns the feature MSRs.
    pub fn feature_msr_index_list(&self) -> Result<&MsrIndexList, Error> {
        self.feature_msr_index_list.try_call_once(|| {
            probe_list("KVM_GET_MSR_FEATURE_INDEX_LIST", |indices| {
                self.ops.get_msr_index_list(MsrListKind::Feature, indices)
            })
            .map(MsrIndexList)
        })
    }

    pub fn msr_in_save_restore_list(&self, index: u32) -> Result<bool, Error> {
        Ok(self.msr_index_list()?.contains(&index))
    }

    /// Reads the value of the feature MSR `index`.
    pub fn feature_msr(&self, index: u32) -> Result<u64, Error> {
        let mut entry = [MsrEntry::new(index)];
        let processed = self
            .ops
            .get_feature_msrs(&mut entry)
            .ioctl("KVM_GET_MSRS")?;
        if processed != 1 {
            return Err(Error::MsrBatch {
                call: "KVM_GET_MSRS",
                index,
                processed,
                total: 1,
            });
        }
        Ok(entry[0].data)
    }

    /// Returns the nested state size the hypervisor reports, or 0 when nested
    /// state is unsupported.
    pub fn nested_state_size(&self) -> usize {
        *self.nested_state_size.call_once(|| {
            let size = usize::try_from(self.capability(Capability::NestedState))
                .unwrap_or(usize::MAX);
            assert!(
                size <= NESTED_STATE_MAX_SIZE,
                "Nested state size too big, {size} > {NESTED_STATE_MAX_SIZE}"
            );
            size
        })
    }

    /// Returns the highest basic CPUID function.
    pub fn max_basic_leaf(&self) -> Result<u32, Error> {
        Ok(self.supported_entry(0, 0)?.eax)
    }

    /// Returns the highest extended CPUID function.
    pub fn max_extended_leaf(&self) -> Result<u32, Error> {
        Ok(self.supported_entry(0x8000_0000, 0)?.eax)
    }

    /// Returns the physical and linear address widths guests may use.
    pub fn address_width(&self) -> Result<AddressWidth, Error> {
        if self.max_extended_leaf()? < 0x8000_0008 {
            let pae = CpuFeature::PAE.is_set_in(self.supported_entry(0x1, 0)?);
            return Ok(AddressWidth {
                pa_bits: if pae { 36 } else { 32 },
                va_bits: 32,
            });
        }

        let eax = self.supported_entry(0x8000_0008, 0)?.eax;
        Ok(AddressWidth {
            pa_bits: eax.get_bits(0..8),
            va_bits: eax.get_bits(8..16),
        })
    }

    /// Tests whether the hypervisor supports `feature` for guests. A missing
    /// leaf means unsupported.
    pub fn has_feature(&self, feature: CpuFeature) -> Result<bool, Error> {
        Ok(self
            .supported_cpuid()?
            .entry(feature.function, feature.index)
            .is_some_and(|entry| feature.is_set_in(entry)))
    }

    /// Fails with [`Error::Unsupported`] unless `feature` is available.
    pub fn require_feature(&self, feature: CpuFeature) -> Result<(), Error> {
        if self.has_feature(feature)? {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("CPU feature {feature}")))
        }
    }

    /// Fails with [`Error::Unsupported`] unless the hypervisor may expose all
    /// XSAVE feature bits in `xfeatures` to guests. Extended features are
    /// dynamically enabled, which needs XFD.
    pub fn require_xfeature(&self, xfeatures: u64) -> Result<(), Error> {
        self.require_feature(CpuFeature::XFD)?;

        let supported = match self
            .ops
            .get_device_attr(KVM_X86_GRP_CPU, KVM_X86_XCOMP_GUEST_SUPP)
        {
            Ok(supported) => supported,
            Err(IoctlError::Unsupported) => 0,
            Err(source) => {
                return Err(Error::Ioctl {
                    call: "KVM_GET_DEVICE_ATTR",
                    source,
                });
            }
        };
        if supported & xfeatures == xfeatures {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("XSAVE features {xfeatures:#x}")))
        }
    }
}

/// Tests whether the host processor is made by Intel.
pub fn is_intel_cpu() -> bool {
    host_vendor_is("GenuineIntel")
}

/// Tests whether the host processor is made by AMD.
pub fn is_amd_cpu() -> bool {
    host_vendor_is("AuthenticAMD")
}

fn host_vendor_is(vendor: &str) -> bool {
    CpuId::new()
        .get_vendor_info()
        .is_some_and(|info| info.as_str() == vendor)
}

/// The host processor details that limit guest physical addresses on AMD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmdAddressInfo {
    pub family: u32,
    pub max_extended_leaf: u32,
    /// CPUID 0x80000008 EAX[7:0].
    pub phys_bits: u32,
    /// CPUID 0x8000001F EBX[11:6]. Bits lost to memory encryption.
    pub encryption_reduction: u32,
}

impl AmdAddressInfo {
    pub fn from_host() -> Self {
        let max_extended_leaf = cpuid!(0x8000_0000).eax;
        let phys_bits = if max_extended_leaf >= 0x8000_0008 {
            cpuid!(0x8000_0008).eax.get_bits(0..8)
        } else {
            0
        };
        let encryption_reduction = if max_extended_leaf >= 0x8000_001f {
            cpuid!(0x8000_001f).ebx.get_bits(6..12)
        } else {
            0
        };
        Self {
            family: x86_family(cpuid!(0x1).eax),
            max_extended_leaf,
            phys_bits,
            encryption_reduction,
        }
    }
}

/// Returns the display family from CPUID.1:EAX.
pub fn x86_family(eax: u32) -> u32 {
    let family = eax.get_bits(8..12);
    if family == 0xf {
        family + eax.get_bits(20..28)
    } else {
        family
    }
}

/// Returns the highest guest frame number usable on this host for a guest with
/// `pa_bits` wide physical addresses.
pub fn compute_max_gfn(pa_bits: u32, page_shift: u32) -> u64 {
    let amd = is_amd_cpu().then(AmdAddressInfo::from_host);
    max_gfn_for(pa_bits, page_shift, amd.as_ref())
}

/// Returns the highest usable guest frame number. On AMD hosts, frames at and
/// above the 12GiB HyperTransport hole just below the top of the physical
/// address space are excluded.
pub fn max_gfn_for(pa_bits: u32, page_shift: u32, amd: Option<&AmdAddressInfo>) -> u64 {
    let max_gfn = (1u64 << (pa_bits - page_shift)) - 1;

    let Some(amd) = amd else {
        return max_gfn;
    };
    // Guests with fewer than 40 physical address bits cannot reach the hole.
    if pa_bits < 40 {
        return max_gfn;
    }

    let num_ht_pages = 12u64 << (30 - page_shift);
    let ht_gfn = if amd.family < 0x17 || amd.max_extended_leaf < 0x8000_0008 {
        (1 << 28) - num_ht_pages
    } else {
        let mut max_pfn = (1u64 << (amd.phys_bits - page_shift)) - 1;
        if amd.max_extended_leaf >= 0x8000_001f {
            max_pfn >>= amd.encryption_reduction;
        }
        max_pfn - num_ht_pages
    };
    max_gfn.min(ht_gfn - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::{MockHypervisor, MockVcpu};

    fn entry(function: u32, index: u32, eax: u32, ecx: u32, edx: u32) -> CpuidEntry {
        CpuidEntry {
            function,
            index,
            eax,
            ecx,
            edx,
            ..Default::default()
        }
    }

    #[test]
    fn msr_list_probed_once() {
        let hv = Arc::new(MockHypervisor {
            msr_indices: vec![0x10, 0x174, 0xc000_0080],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv.clone());

        assert_eq!(**cache.msr_index_list().unwrap(), [0x10, 0x174, 0xc000_0080]);
        assert_eq!(cache.msr_index_list().unwrap().len(), 3);
        assert!(cache.msr_in_save_restore_list(0x174).unwrap());
        assert!(!cache.msr_in_save_restore_list(0x175).unwrap());

        // One sizing call and one filling call, never repeated.
        assert_eq!(hv.probe_count("KVM_GET_MSR_INDEX_LIST"), 2);
    }

    #[test]
    fn msr_list_sized_by_first_probe() {
        let hv = Arc::new(MockHypervisor {
            msr_indices: (0..137).collect(),
            ..Default::default()
        });
        let cache = CpuidCache::new(hv.clone());

        let first = cache.msr_index_list().unwrap();
        assert_eq!(first.len(), 137);
        assert_eq!(first[136], 136);
        assert!(core::ptr::eq(first, cache.msr_index_list().unwrap()));
        assert_eq!(hv.probe_count("KVM_GET_MSR_INDEX_LIST"), 2);

        // Only a new cache probes again.
        let cache = CpuidCache::new(hv.clone());
        assert_eq!(cache.msr_index_list().unwrap().len(), 137);
        assert_eq!(hv.probe_count("KVM_GET_MSR_INDEX_LIST"), 4);
    }

    #[test]
    #[should_panic(expected = "Number of entries in KVM_GET_MSR_INDEX_LIST changed")]
    fn msr_list_count_changed() {
        let hv = Arc::new(MockHypervisor {
            msr_indices: vec![0x10, 0x174],
            shrink_msr_list_after_probe: true,
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);
        let _ = cache.msr_index_list();
    }

    #[test]
    fn failed_probe_is_retried() {
        let hv = Arc::new(MockHypervisor {
            fail_probes: 1,
            cpuid: vec![entry(0, 0, 0xd, 0, 0)],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);

        let err = cache.supported_cpuid().unwrap_err();
        assert!(matches!(err, Error::Ioctl { call: "KVM_GET_SUPPORTED_CPUID", .. }));
        assert_eq!(cache.max_basic_leaf().unwrap(), 0xd);
    }

    #[test]
    fn hv_cpuid_full_replaces_hypervisor_range() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![
                entry(0, 0, 0xd, 0, 0),
                entry(0x4000_0000, 0, 0x4000_0001, 0, 0),
                entry(0x4000_0001, 0, 0x1, 0, 0),
                entry(0x8000_0000, 0, 0x8000_0008, 0, 0),
            ],
            hv_cpuid: vec![
                entry(0x4000_0000, 0, 0x4000_000a, 0, 0),
                entry(0x4000_0003, 0, 0xff, 0, 0),
            ],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);

        let full = cache.hv_cpuid_full().unwrap();
        assert_eq!(full.len(), 4);
        assert_eq!(full.find_entry(0x4000_0000, 0).eax, 0x4000_000a);
        assert!(full.entry(0x4000_0001, 0).is_none());
        assert_eq!(full.find_entry(0x8000_0000, 0).eax, 0x8000_0008);
    }

    #[test]
    fn address_width() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![
                entry(0x8000_0000, 0, 0x8000_0008, 0, 0),
                entry(0x8000_0008, 0, 0x3027, 0, 0),
            ],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);
        assert_eq!(
            cache.address_width().unwrap(),
            AddressWidth {
                pa_bits: 39,
                va_bits: 48
            }
        );
    }

    #[test]
    fn address_width_without_extended_leaf() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![
                entry(0x1, 0, 0, 0, 1 << 6),
                entry(0x8000_0000, 0, 0x8000_0004, 0, 0),
            ],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);
        assert_eq!(
            cache.address_width().unwrap(),
            AddressWidth {
                pa_bits: 36,
                va_bits: 32
            }
        );
    }

    #[test]
    #[should_panic(expected = "CPUID function 0x80000008 index 0x0 not found")]
    fn missing_entry_is_fatal() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![entry(0x8000_0000, 0, 0x8000_0008, 0, 0)],
            ..Default::default()
        });
        let _ = CpuidCache::new(hv).address_width();
    }

    #[test]
    fn features_and_skips() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![entry(0x1, 0, 0, 1 << 26, 0), entry(0xd, 1, 1 << 4, 0, 0)],
            xcomp_guest_supp: Some(0x7),
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);

        assert!(cache.has_feature(CpuFeature::XSAVE).unwrap());
        assert!(!cache.has_feature(CpuFeature::OSXSAVE).unwrap());
        assert!(!cache.has_feature(CpuFeature::SVM).unwrap());
        assert!(cache.require_feature(CpuFeature::XSAVE).is_ok());
        assert!(cache.require_feature(CpuFeature::VMX).unwrap_err().is_skip());

        assert!(cache.require_xfeature(0x3).is_ok());
        assert!(cache.require_xfeature(1 << 18).unwrap_err().is_skip());
        assert!(cache.require_capability(Capability::Xsave2).unwrap_err().is_skip());
    }

    #[test]
    fn xfeature_requires_xfd() {
        let hv = Arc::new(MockHypervisor {
            cpuid: vec![entry(0xd, 1, 0xf, 0, 0)],
            xcomp_guest_supp: Some(0x6_0007),
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);

        let err = cache.require_xfeature(1 << 18).unwrap_err();
        assert!(err.is_skip());
        assert_eq!(err, Error::Unsupported("CPU feature XFD".into()));
    }

    #[test]
    fn feature_msr_list_enumerated_once() {
        let hv = Arc::new(MockHypervisor {
            msr_indices: vec![0x10],
            feature_msr_indices: vec![0x10a, 0x345, 0x480],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv.clone());

        assert_eq!(**cache.feature_msr_index_list().unwrap(), [0x10a, 0x345, 0x480]);
        assert_eq!(hv.probe_count("KVM_GET_MSR_FEATURE_INDEX_LIST"), 2);
        assert!(core::ptr::eq(
            cache.feature_msr_index_list().unwrap(),
            cache.feature_msr_index_list().unwrap()
        ));
        assert_eq!(hv.probe_count("KVM_GET_MSR_FEATURE_INDEX_LIST"), 2);

        // The save/restore list is a separate enumeration.
        assert_eq!(hv.probe_count("KVM_GET_MSR_INDEX_LIST"), 0);
        assert_eq!(**cache.msr_index_list().unwrap(), [0x10]);
    }

    #[test]
    fn empty_list_is_not_resized() {
        let hv = Arc::new(MockHypervisor::default());
        let cache = CpuidCache::new(hv.clone());

        assert!(cache.feature_msr_index_list().unwrap().is_empty());
        assert_eq!(hv.probe_count("KVM_GET_MSR_FEATURE_INDEX_LIST"), 1);
    }

    #[test]
    fn feature_msr_read() {
        let hv = Arc::new(MockHypervisor {
            feature_msrs: vec![MsrEntry {
                index: 0x10a,
                data: 0x2b,
            }],
            ..Default::default()
        });
        let cache = CpuidCache::new(hv);
        assert_eq!(cache.feature_msr(0x10a).unwrap(), 0x2b);
        assert!(matches!(
            cache.feature_msr(0x48b),
            Err(Error::MsrBatch { index: 0x48b, processed: 0, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "Nested state size too big")]
    fn nested_state_size_limit() {
        let hv = Arc::new(MockHypervisor {
            caps: vec![(Capability::NestedState, 0x8000)],
            ..Default::default()
        });
        let _ = CpuidCache::new(hv).nested_state_size();
    }

    #[test]
    fn vcpu_cpuid_probe() {
        let mut vcpu = MockVcpu::default();
        vcpu.cpuid = vec![entry(0, 0, 0xd, 0, 0), entry(0x1, 0, 0, 1 << 27, 0)];

        let list = vcpu_cpuid(&vcpu).unwrap();
        assert_eq!(list.len(), 2);
        assert!(CpuFeature::OSXSAVE.is_set_in(list.find_entry(0x1, 0)));

        let mut replaced = list.clone();
        replaced.replace_entry(entry(0x1, 0, 0, 0, 0));
        assert!(!CpuFeature::OSXSAVE.is_set_in(replaced.find_entry(0x1, 0)));
    }

    #[test]
    fn family_decode() {
        assert_eq!(x86_family(0x0000_0f41), 0xf);
        assert_eq!(x86_family(0x00a2_0f10), 0x19);
        assert_eq!(x86_family(0x0009_06ea), 0x6);
    }

    #[test]
    fn max_gfn_without_hole() {
        assert_eq!(max_gfn_for(36, 12, None), (1 << 24) - 1);

        let amd = AmdAddressInfo {
            family: 0x19,
            max_extended_leaf: 0x8000_0021,
            phys_bits: 48,
            encryption_reduction: 0,
        };
        assert_eq!(max_gfn_for(39, 12, Some(&amd)), (1 << 27) - 1);
    }

    #[test]
    fn max_gfn_below_hypertransport_hole() {
        let num_ht_pages = 12u64 << 18;

        let old = AmdAddressInfo {
            family: 0x15,
            max_extended_leaf: 0x8000_001e,
            phys_bits: 48,
            encryption_reduction: 0,
        };
        assert_eq!(max_gfn_for(48, 12, Some(&old)), (1 << 28) - num_ht_pages - 1);

        let sme = AmdAddressInfo {
            family: 0x19,
            max_extended_leaf: 0x8000_0021,
            phys_bits: 48,
            encryption_reduction: 5,
        };
        let max_pfn = ((1u64 << 36) - 1) >> 5;
        assert_eq!(max_gfn_for(48, 12, Some(&sme)), max_pfn - num_ht_pages - 1);
    }
}
