//! The guest's 4-level paging structures. Tables live in guest physical memory
//! and are allocated on demand.

use bit_field::BitField;
use core::fmt::{self, Write};
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

use super::{VmMode, platform_ops::GuestMemory};

pub const PTE_PRESENT_MASK: u64 = 1 << 0;
pub const PTE_WRITABLE_MASK: u64 = 1 << 1;
pub const PTE_USER_MASK: u64 = 1 << 2;
pub const PTE_ACCESSED_MASK: u64 = 1 << 5;
pub const PTE_DIRTY_MASK: u64 = 1 << 6;
pub const PTE_LARGE_MASK: u64 = 1 << 7;
pub const PTE_GLOBAL_MASK: u64 = 1 << 8;
pub const PTE_NX_MASK: u64 = 1 << 63;

/// Bits 51:12, the frame address held by an entry.
pub const PHYSICAL_PAGE_MASK: u64 = genmask(51, BASE_PAGE_SHIFT as u32);

const ENTRIES_PER_TABLE: usize = 512;

/// Returns a mask with bits `high` through `low` set.
pub const fn genmask(high: u32, low: u32) -> u64 {
    (u64::MAX >> (63 - high)) & !((1u64 << low) - 1)
}

/// Tests whether the upper 16 bits of `vaddr` replicate bit 47.
pub fn is_canonical(vaddr: u64) -> bool {
    vaddr == (((vaddr << 16) as i64) >> 16) as u64
}

/// Returns the bits that must be zero in a paging structure entry on a
/// processor with `max_phy_addr` physical address bits. The execute-disable bit
/// is reserved unless `nx_enabled`.
pub fn reserved_bits_mask(max_phy_addr: u32, nx_enabled: bool) -> u64 {
    let mut mask = genmask(51, max_phy_addr);
    if !nx_enabled {
        mask |= PTE_NX_MASK;
    }
    mask
}

/// A level in the paging hierarchy, named after the size of the region an
/// entry at that level maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum PageLevel {
    #[display("4K")]
    Size4K = 1,
    #[display("2M")]
    Size2M = 2,
    #[display("1G")]
    Size1G = 3,
    #[display("512G")]
    Size512G = 4,
}

impl PageLevel {
    /// From the root down to the leaf.
    const WALK: [Self; 4] = [Self::Size512G, Self::Size1G, Self::Size2M, Self::Size4K];

    pub const fn shift(self) -> u32 {
        (self as u32 - 1) * 9 + BASE_PAGE_SHIFT as u32
    }

    pub const fn size(self) -> u64 {
        1 << self.shift()
    }

    /// Returns the table index `vaddr` selects at this level.
    pub fn index(self, vaddr: u64) -> usize {
        let shift = self.shift() as usize;
        vaddr.get_bits(shift..shift + 9) as usize
    }

    /// Returns the conventional name of an entry at this level.
    pub fn entry_name(self) -> &'static str {
        match self {
            Self::Size4K => "pte",
            Self::Size2M => "pde",
            Self::Size1G => "pdpe",
            Self::Size512G => "pml4e",
        }
    }
}

bitfield::bitfield! {
    /// Figure 4-11. Formats of CR3 and Paging-Structure Entries with 4-Level
    /// Paging
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub write_through, set_write_through: 3;
    pub cache_disable, set_cache_disable: 4;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
    pub large, set_large: 7;
    pub global, set_global: 8;
    pub pfn, set_pfn: 51, 12;
    pub nx, set_nx: 63;
}

impl Entry {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Returns the physical address of the frame or table this entry points to.
    pub fn address(self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    /// A present, writable entry pointing at `paddr`.
    fn new_present(paddr: u64) -> Self {
        let mut entry = Self::default();
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_pfn((paddr & PHYSICAL_PAGE_MASK) >> BASE_PAGE_SHIFT);
        entry
    }
}

#[derive(Debug)]
#[repr(C, align(4096))]
pub(crate) struct Table {
    pub(crate) entries: [Entry; ENTRIES_PER_TABLE],
}
const _: () = assert!(core::mem::size_of::<Table>() == BASE_PAGE_SIZE);

fn table<M: GuestMemory + ?Sized>(mem: &M, gpa: u64) -> &Table {
    // Safety: `GuestMemory` guarantees a page aligned pointer valid for the
    // whole page, and tables are only ever placed at page aligned addresses.
    unsafe { &*mem.gpa2hva(gpa).cast::<Table>() }
}

fn table_mut<M: GuestMemory + ?Sized>(mem: &mut M, gpa: u64) -> &mut Table {
    // Safety: see `table`. The exclusive borrow of `mem` keeps other references
    // into guest memory from being created meanwhile.
    unsafe { &mut *mem.gpa2hva(gpa).cast::<Table>() }
}

/// The root of the guest's paging hierarchy.
///
/// Mapping is monotonic: entries are added or, through
/// [`PagingStructures::leaf_entry_mut`], edited in place, but tables are never
/// freed.
#[derive(Debug)]
pub struct PagingStructures {
    pgd: Option<u64>,
}

impl PagingStructures {
    pub fn new(mode: VmMode) -> Self {
        assert!(
            mode == VmMode::PxxV48_4K,
            "Attempt to use unknown or unsupported guest mode, mode: {mode:?}"
        );
        Self { pgd: None }
    }

    /// Returns the guest physical address of the PML4, if allocated.
    pub fn pgd(&self) -> Option<u64> {
        self.pgd
    }

    /// Allocates the PML4 unless already done. Returns its guest physical
    /// address.
    pub fn alloc_root<M: GuestMemory + ?Sized>(&mut self, mem: &mut M) -> u64 {
        *self.pgd.get_or_insert_with(|| {
            let pgd = mem.alloc_page_table();
            log::debug!("PML4 allocated at {pgd:#x}");
            pgd
        })
    }

    /// Maps the page of `level` size at `vaddr` to `paddr`.
    ///
    /// Intermediate tables are created as needed. Replacing an existing
    /// translation or splitting a large page is a contract violation.
    pub fn map<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        paddr: u64,
        level: PageLevel,
    ) {
        let page_size = level.size();

        assert!(
            level <= PageLevel::Size1G,
            "Cannot map a page at level: {level}, vaddr: {vaddr:#x}"
        );
        assert!(
            vaddr % page_size == 0,
            "Virtual address not aligned,\n  vaddr: {vaddr:#x} page size: {page_size:#x}"
        );
        assert!(
            mem.is_vpage_valid(vaddr >> BASE_PAGE_SHIFT),
            "Invalid virtual address, vaddr: {vaddr:#x}"
        );
        assert!(
            paddr % page_size == 0,
            "Physical address not aligned,\n  paddr: {paddr:#x} page size: {page_size:#x}"
        );
        assert!(
            (paddr >> BASE_PAGE_SHIFT) <= mem.max_gfn(),
            "Physical address beyond maximum supported,\n  paddr: {paddr:#x} max_gfn: {:#x}",
            mem.max_gfn()
        );

        log::trace!("Mapping {vaddr:#x} -> {paddr:#x} ({level})");
        let mut table_gpa = self.alloc_root(mem);
        for current in [PageLevel::Size512G, PageLevel::Size1G, PageLevel::Size2M] {
            let entry = create_upper_entry(mem, table_gpa, vaddr, paddr, current, level);
            if entry.large() {
                return;
            }
            table_gpa = entry.address();
        }

        let entry = &mut table_mut(mem, table_gpa).entries[PageLevel::Size4K.index(vaddr)];
        assert!(
            !entry.present(),
            "PTE already present for 4k page at vaddr: {vaddr:#x}"
        );
        *entry = Entry::new_present(paddr);
    }

    /// Translates `gva` into a guest physical address. The address must be
    /// mapped.
    pub fn translate<M: GuestMemory + ?Sized>(&self, mem: &M, gva: u64) -> u64 {
        let mut table_gpa = self
            .pgd
            .unwrap_or_else(|| panic!("No mapping for vm virtual address, gva: {gva:#x}"));

        for level in PageLevel::WALK {
            let entry = table(mem, table_gpa).entries[level.index(gva)];
            assert!(
                entry.present(),
                "No mapping for vm virtual address, gva: {gva:#x}"
            );
            if level == PageLevel::Size4K || entry.large() {
                return entry.address() + (gva & (level.size() - 1));
            }
            table_gpa = entry.address();
        }
        unreachable!("the walk ends at the 4K level")
    }

    /// Returns the 4K leaf entry mapping `gva` for in-place editing.
    ///
    /// The walk requires every level to be present, no upper level to map a
    /// large page and no bit of `reserved_mask` to be set in upper levels.
    pub fn leaf_entry_mut<'m, M: GuestMemory + ?Sized>(
        &self,
        mem: &'m mut M,
        gva: u64,
        reserved_mask: u64,
    ) -> &'m mut Entry {
        assert!(
            mem.is_vpage_valid(gva >> BASE_PAGE_SHIFT),
            "Invalid virtual address, vaddr: {gva:#x}"
        );
        // Bits 63:48 must replicate bit 47.
        assert!(
            is_canonical(gva),
            "Canonical check failed.  The virtual address is invalid."
        );

        let mut table_gpa = self
            .pgd
            .unwrap_or_else(|| panic!("Expected pml4e to be present for gva: {gva:#x}"));
        for level in [PageLevel::Size512G, PageLevel::Size1G, PageLevel::Size2M] {
            let entry = table(mem, table_gpa).entries[level.index(gva)];
            assert!(
                entry.present(),
                "Expected {} to be present for gva: {gva:#x}",
                level.entry_name()
            );
            assert!(
                !entry.large(),
                "Expected {} to map a table not a {level} page, gva: {gva:#x}",
                level.entry_name()
            );
            assert!(
                entry.bits() & reserved_mask == 0,
                "Unexpected reserved bits set, {}: {:#x}",
                level.entry_name(),
                entry.bits()
            );
            table_gpa = entry.address();
        }

        let entry = &mut table_mut(mem, table_gpa).entries[PageLevel::Size4K.index(gva)];
        assert!(
            entry.present(),
            "Expected pte to be present for gva: {gva:#x}"
        );
        entry
    }

    /// Writes every present entry, indented by `indent` spaces.
    pub fn dump<M: GuestMemory + ?Sized>(
        &self,
        mem: &M,
        out: &mut dyn Write,
        indent: usize,
    ) -> fmt::Result {
        let Some(pgd) = self.pgd else {
            return Ok(());
        };
        writeln!(
            out,
            "{:indent$}                 index hvaddr         gpaddr         addr         w exec dirty",
            ""
        )?;
        dump_table(mem, out, indent, pgd, PageLevel::Size512G, 0)
    }
}

/// Returns the entry for `vaddr` in the table at `table_gpa`, creating it
/// when absent. At the `target` level, the entry maps `paddr` as a large page;
/// above it, the entry points to a newly allocated table.
fn create_upper_entry<M: GuestMemory + ?Sized>(
    mem: &mut M,
    table_gpa: u64,
    vaddr: u64,
    paddr: u64,
    current: PageLevel,
    target: PageLevel,
) -> Entry {
    let index = current.index(vaddr);
    let entry = table(mem, table_gpa).entries[index];

    if entry.present() {
        assert!(
            current != target,
            "Cannot create hugepage at level: {current}, vaddr: {vaddr:#x}"
        );
        assert!(
            !entry.large(),
            "Cannot create page table at level: {current}, vaddr: {vaddr:#x}"
        );
        return entry;
    }

    let entry = if current == target {
        let mut entry = Entry::new_present(paddr);
        entry.set_large(true);
        entry
    } else {
        Entry::new_present(mem.alloc_page_table())
    };
    table_mut(mem, table_gpa).entries[index] = entry;
    entry
}

fn dump_table<M: GuestMemory + ?Sized>(
    mem: &M,
    out: &mut dyn Write,
    indent: usize,
    table_gpa: u64,
    level: PageLevel,
    vaddr_base: u64,
) -> fmt::Result {
    let depth = PageLevel::Size512G as usize - level as usize;
    let table = table(mem, table_gpa);

    for (index, entry) in table.entries.iter().enumerate() {
        if !entry.present() {
            continue;
        }
        let vaddr = vaddr_base | ((index as u64) << level.shift());
        let hva: *const Entry = entry;
        let name = level.entry_name();
        write!(
            out,
            "{:width$}{name:<5} 0x{index:<3x} {hva:p} 0x{:<12x} 0x{:<10x} {}  {}",
            "",
            mem.hva2gpa(hva.cast()),
            entry.pfn(),
            u8::from(entry.writable()),
            u8::from(entry.nx()),
            width = indent + depth * 2,
        )?;

        if level == PageLevel::Size4K || entry.large() {
            writeln!(out, " {}  0x{vaddr:x}", u8::from(entry.dirty()))?;
        } else {
            writeln!(out)?;
            let lower = PageLevel::WALK[depth + 1];
            dump_table(mem, out, indent, entry.address(), lower, vaddr)?;
        }
    }
    Ok(())
}
