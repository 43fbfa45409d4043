use num_derive::FromPrimitive;

/// The type of a single base relocation entry, packed into the high 4 bits
/// of each `WORD` in an `IMAGE_BASE_RELOCATION` block. This is the complete
/// set Microsoft documents for `IMAGE_REL_BASED_*`; the Relocator only acts
/// on [`BaseRelocationType::Absolute`], [`BaseRelocationType::HighLow`], and
/// [`BaseRelocationType::Dir64`] — the three types MemoryModule.c's
/// `PerformBaseRelocation` handles. Every other variant is a no-op padding
/// entry or an architecture this crate does not load on.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BaseRelocationType {
    /// The base relocation is skipped. Used to pad a block to a 32-bit
    /// boundary.
    Absolute = 0,
    /// The base relocation adds the high 16 bits of the difference to the
    /// 16-bit field at the offset. Only ever used with a paired `Low`
    /// entry; not produced for x86/x64 images.
    High = 1,
    /// The base relocation adds the low 16 bits of the difference to the
    /// 16-bit field at the offset.
    Low = 2,
    /// The base relocation applies all 32 bits of the difference to the
    /// 32-bit field at the offset. The common case for 32-bit images.
    HighLow = 3,
    /// Like `HighLow`, but with a following entry that holds a signed
    /// 16-bit adjustment to the high 16 bits of the difference.
    HighAdj = 4,
    /// MIPS/RISC-V: interpretation depends on the image's machine type.
    /// Aliases `MipsJmpAddr` and `RiscvHigh20`.
    MipsJmpAddrOrRiscvHigh20 = 5,
    /// Reserved, must not be used.
    Reserved = 6,
    /// ARM/Thumb/RISC-V: interpretation depends on the image's machine
    /// type. Aliases `ThumbMov32` and `RiscvLow12I`.
    ThumbMov32OrRiscvLow12I = 7,
    /// RISC-V: the relocation applies to the low 12 bits of a 32-bit
    /// absolute address formed by an S-type instruction.
    RiscvLow12S = 8,
    /// MIPS/LoongArch: interpretation depends on the image's machine type.
    MipsJmpAddr16OrLoongArch = 9,
    /// The relocation applies the difference to the 64-bit field at the
    /// offset. The common case for x64 images.
    Dir64 = 10,
}

impl BaseRelocationType {
    /// Whether the Relocator patches this entry type. Every value this
    /// crate does not implement a patch for (high/low split relocations,
    /// other architectures' MIPS/ARM/RISC-V encodings) is skipped silently,
    /// for forward compatibility, same as `Absolute`'s deliberate no-op
    /// padding entries.
    pub fn is_handled(self) -> bool {
        matches!(
            self,
            BaseRelocationType::Absolute | BaseRelocationType::HighLow | BaseRelocationType::Dir64
        )
    }
}
