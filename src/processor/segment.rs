use bit_field::BitField;
use core::fmt::{self, Write};
use x86::segmentation::{SegmentSelector, SystemDescriptorTypes64};

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    #[error("`{selector:?}` points to the null descriptor")]
    NullDescriptor { selector: SegmentSelector },

    #[error("`{selector:?}` points to LDT where parsing is unimplemented")]
    LdtAccess { selector: SegmentSelector },

    #[error("`{index}` points to outside GDT")]
    OutOfGdtAccess { index: usize },

    #[error("`{index}` points to `{entry:#x}`, which is invalid as a descriptor")]
    InvalidGdtEntry { index: usize, entry: u64 },
}

// Type field values of code and data segments. See: 3.4.5.1 Code- and
// Data-Segment Descriptor Types
const TYPE_ACCESSED: u8 = 0b0001;
const TYPE_DATA_WRITABLE: u8 = 0b0010;
const TYPE_CODE_READABLE: u8 = 0b0010;
const TYPE_CODE: u8 = 0b1000;

/// The size in bytes of a 64-bit TSS, minus one.
pub const TSS64_LIMIT: u32 = 0x67;

/// A segment register in the unpacked form the hypervisor exchanges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    /// The limit in bytes, already scaled when `g` is set.
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: bool,
    pub dpl: u8,
    pub db: bool,
    /// Set for code and data segments, clear for system segments.
    pub s: bool,
    pub l: bool,
    pub g: bool,
    pub avl: bool,
    pub unusable: bool,
}

impl Segment {
    pub fn unusable() -> Self {
        Self {
            unusable: true,
            ..Self::default()
        }
    }

    /// A flat, present, ring 0, 64-bit code segment.
    pub fn code64(selector: u16) -> Self {
        Self {
            limit: 0xffff_ffff,
            selector,
            type_: TYPE_CODE | TYPE_CODE_READABLE | TYPE_ACCESSED,
            present: true,
            s: true,
            l: true,
            g: true,
            ..Self::default()
        }
    }

    /// A flat, present, ring 0, writable data segment.
    pub fn data64(selector: u16) -> Self {
        Self {
            limit: 0xffff_ffff,
            selector,
            type_: TYPE_DATA_WRITABLE | TYPE_ACCESSED,
            present: true,
            s: true,
            g: true,
            ..Self::default()
        }
    }

    /// A busy 64-bit TSS at `base`.
    pub fn tss64(base: u64, selector: u16) -> Self {
        Self {
            base,
            limit: TSS64_LIMIT,
            selector,
            type_: SystemDescriptorTypes64::TssBusy as u8,
            present: true,
            ..Self::default()
        }
    }

    pub fn dump(&self, out: &mut dyn Write, indent: usize) -> fmt::Result {
        writeln!(
            out,
            "{:indent$}base: 0x{:016x} limit: 0x{:08x} selector: 0x{:04x} type: 0x{:02x}",
            "", self.base, self.limit, self.selector, self.type_
        )?;
        writeln!(
            out,
            "{:indent$}present: 0x{:02x} dpl: 0x{:02x} db: 0x{:02x} s: 0x{:02x} l: 0x{:02x}",
            "",
            u8::from(self.present),
            self.dpl,
            u8::from(self.db),
            u8::from(self.s),
            u8::from(self.l)
        )?;
        writeln!(
            out,
            "{:indent$}g: 0x{:02x} avl: 0x{:02x} unusable: 0x{:02x}",
            "",
            u8::from(self.g),
            u8::from(self.avl),
            u8::from(self.unusable)
        )
    }
}

/// A segment descriptor as stored in the GDT. System descriptors take two
/// slots in 64-bit mode; the second holds bits 63:32 of the base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    low64: SegmentDescriptorRaw,
    upper_base: Option<u32>,
}

impl SegmentDescriptor {
    /// Packs `segment`. The upper half of the base is kept only for system
    /// segments.
    pub fn from_segment(segment: &Segment) -> Self {
        let upper_base = (!segment.s).then(|| segment.base.get_bits(32..) as u32);
        Self {
            low64: SegmentDescriptorRaw::pack(segment),
            upper_base,
        }
    }

    /// Writes the descriptor into the slot(s) of `gdt` that `selector` selects.
    pub fn write_to(&self, gdt: &mut [u64], selector: u16) {
        let index = usize::from(selector >> 3);
        gdt[index] = self.low64.raw;
        if let Some(upper_base) = self.upper_base {
            gdt[index + 1] = u64::from(upper_base);
        }
    }

    /// Reads the descriptor `selector` selects from `gdt`.
    pub fn try_from_gdt(gdt: &[u64], selector: SegmentSelector) -> Result<Self, SegmentError> {
        if selector.contains(SegmentSelector::TI_LDT) {
            return Err(SegmentError::LdtAccess { selector });
        }

        let index = selector.index() as usize;
        if index == 0 {
            return Err(SegmentError::NullDescriptor { selector });
        }

        let raw = gdt
            .get(index)
            .ok_or(SegmentError::OutOfGdtAccess { index })?;

        let low64 = SegmentDescriptorRaw::from(*raw);
        let upper_base = if low64.is_16byte() {
            let index: usize = index + 1;

            let raw = gdt
                .get(index)
                .ok_or(SegmentError::OutOfGdtAccess { index })?;

            let Ok(upper_base) = u32::try_from(*raw) else {
                return Err(SegmentError::InvalidGdtEntry { index, entry: *raw });
            };

            Some(upper_base)
        } else {
            None
        };
        Ok(Self { low64, upper_base })
    }

    pub fn base(&self) -> u64 {
        if let Some(upper_base) = self.upper_base {
            u64::from(self.low64.base()) | u64::from(upper_base) << 32
        } else {
            u64::from(self.low64.base())
        }
    }

    /// Unpacks the descriptor into the segment register form.
    pub fn to_segment(&self, selector: u16) -> Segment {
        let raw = self.low64.raw;
        let g = raw.get_bit(55);
        let mut limit = (raw.get_bits(0..16) | raw.get_bits(48..52) << 16) as u32;
        if g {
            limit = limit << 12 | 0xfff;
        }
        Segment {
            base: self.base(),
            limit,
            selector,
            type_: raw.get_bits(40..44) as u8,
            s: raw.get_bit(44),
            dpl: raw.get_bits(45..47) as u8,
            present: raw.get_bit(47),
            avl: raw.get_bit(52),
            l: raw.get_bit(53),
            db: raw.get_bit(54),
            g,
            unusable: false,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.low64.raw
    }
}

/// Raw representation of a segment descriptor.
/// See: 3.4.5 Segment Descriptors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SegmentDescriptorRaw {
    raw: u64,
}

impl SegmentDescriptorRaw {
    fn pack(segment: &Segment) -> Self {
        let mut raw = 0u64;
        let _ = raw
            .set_bits(0..16, u64::from(segment.limit).get_bits(0..16))
            .set_bits(16..40, segment.base.get_bits(0..24))
            .set_bits(40..44, u64::from(segment.type_))
            .set_bit(44, segment.s)
            .set_bits(45..47, u64::from(segment.dpl & 0b11))
            .set_bit(47, segment.present)
            .set_bits(48..52, u64::from(segment.limit).get_bits(16..20))
            .set_bit(52, segment.avl)
            .set_bit(53, segment.l)
            .set_bit(54, segment.db)
            .set_bit(55, segment.g)
            .set_bits(56..64, segment.base.get_bits(24..32));
        Self { raw }
    }

    // "In 64-bit mode, the TSS descriptor is expanded to 16 bytes (...)."
    // See: 8.2.3 TSS Descriptor in 64-bit mode
    fn is_16byte(&self) -> bool {
        let high32 = self.raw.get_bits(32..);
        let system = high32.get_bit(12); // descriptor type
        let type_ = high32.get_bits(8..=11) as u8;
        !system
            && (type_ == SystemDescriptorTypes64::TssAvailable as u8
                || type_ == SystemDescriptorTypes64::TssBusy as u8)
    }

    fn base(&self) -> u32 {
        let low32 = self.raw.get_bits(..=31);
        let high32 = self.raw.get_bits(32..);

        let base_high = high32.get_bits(24..=31) << 24;
        let base_middle = high32.get_bits(0..=7) << 16;
        let base_low = low32.get_bits(16..=31);
        (base_high | base_middle | base_low) as u32
    }
}

impl From<u64> for SegmentDescriptorRaw {
    fn from(raw: u64) -> Self {
        Self { raw }
    }
}
