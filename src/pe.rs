use crate::{
    coff::{CoffFileHeader, Characteristics, MachineTypes},
    error::Error,
    optional::{DataDirectories, Optional, OptionalHeader32, OptionalHeader64, Magic},
    section::{parse_section_table, SectionHeader},
};
use bytemuck::checked::try_from_bytes;
use num_traits::FromPrimitive;
use core::fmt;

const IMAGE_DOS_SIGNATURE_OFFSET: usize = 0x3c;
const IMAGE_DOS_MAGIC: u16 = 0x5a4d;
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;
const COFF_HEADER_SIZE: usize = 20;

/// Representation of the headers and section table of a Portable Executable.
///
/// Produced by [`parse_portable_executable`], which is the Header Validator:
/// every field here has already been checked to sit inside the input buffer
/// and the buffer has already been confirmed to describe an image for the
/// host architecture.
pub struct PortableExecutable {
    /// COFF File Header (Object and Image)
    pub coff: CoffFileHeader,
    /// PE32 Optional Header (Image Only)
    pub optional_header_32: Option<OptionalHeader32>,
    /// PE32+ Optional Header (Image Only)
    pub optional_header_64: Option<OptionalHeader64>,
    /// Table containing a list of section headers
    pub section_table: Vec<SectionHeader>,
}

impl PortableExecutable {
    /// Preferred load address from the optional header, widened to `u64`
    /// regardless of whether this is a PE32 or PE32+ image.
    pub fn image_base(&self) -> u64 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.image_base as u64,
            (_, Some(h)) => h.image_base,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `SectionAlignment` from the optional header.
    pub fn section_alignment(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.section_alignment,
            (_, Some(h)) => h.section_alignment,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `SizeOfImage` from the optional header.
    pub fn size_of_image(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.size_of_image,
            (_, Some(h)) => h.size_of_image,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `SizeOfHeaders` from the optional header.
    pub fn size_of_headers(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.size_of_headers,
            (_, Some(h)) => h.size_of_headers,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `SizeOfInitializedData` from the optional header: the image-wide
    /// total the Section Finalizer falls back to for a section that
    /// carries no raw data but is marked `CNT_INITIALIZED_DATA`.
    pub fn size_of_initialized_data(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.size_of_initialized_data,
            (_, Some(h)) => h.size_of_initialized_data,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `SizeOfUninitializedData` from the optional header: the same
    /// fallback as [`Self::size_of_initialized_data`], for sections marked
    /// `CNT_UNINITIALIZED_DATA` instead.
    pub fn size_of_uninitialized_data(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.size_of_uninitialized_data,
            (_, Some(h)) => h.size_of_uninitialized_data,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// `AddressOfEntryPoint` from the optional header.
    pub fn address_of_entry_point(&self) -> u32 {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => h.address_of_entry_point,
            (_, Some(h)) => h.address_of_entry_point,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// The data directory array (imports, relocations, TLS, resources, ...).
    pub fn data_directories(&self) -> &DataDirectories {
        match (&self.optional_header_32, &self.optional_header_64) {
            (Some(h), _) => &h.data_directories,
            (_, Some(h)) => &h.data_directories,
            (None, None) => unreachable!("validated PE always has an optional header"),
        }
    }

    /// Whether the COFF characteristics mark this image as a DLL.
    pub fn is_dll(&self) -> bool {
        self.coff
            .get_characteristics()
            .map(|c| c.contains(Characteristics::IMAGE_FILE_DLL))
            .unwrap_or(false)
    }
}

/// Header Validator: checks DOS/NT signatures, machine type, and section
/// alignment, and parses the COFF header, optional header, and section
/// table. No memory is committed or mapped by this step — it only confirms
/// the buffer describes a loadable image for the host architecture.
///
/// Checks are performed in the order spec'd: DOS header bounds, DOS magic,
/// NT header bounds, NT signature, machine type, section alignment parity.
/// Any failure is [`Error::BadFormat`] (signature/machine/alignment) or
/// [`Error::InvalidData`] (buffer too short for a claimed offset).
pub fn parse_portable_executable(binary: &[u8]) -> Result<PortableExecutable, Error> {
    if binary.len() < core::mem::size_of::<DosHeader>() {
        return Err(Error::InvalidData);
    }

    let dos_magic = read_u16(binary, 0)?;
    if dos_magic != IMAGE_DOS_MAGIC {
        return Err(Error::BadFormat);
    }

    let mut offset: usize = read_u32(binary, IMAGE_DOS_SIGNATURE_OFFSET)? as usize;

    let slice = binary.get(offset..offset + 4).ok_or(Error::InvalidData)?;
    let signature = u32::from_le_bytes(slice.try_into().expect("slice is 4 bytes"));
    if signature != IMAGE_NT_SIGNATURE {
        return Err(Error::BadFormat);
    }

    offset += 4;

    let mut pe = PortableExecutable {
        coff: CoffFileHeader::default(),
        optional_header_32: None,
        optional_header_64: None,
        section_table: Vec::new(),
    };

    let slice = binary
        .get(offset..offset + COFF_HEADER_SIZE)
        .ok_or(Error::InvalidData)?;
    pe.coff = *try_from_bytes::<CoffFileHeader>(slice).map_err(|_| Error::InvalidData)?;

    if MachineTypes::from_u16(pe.coff.machine) != Some(host_machine_type()) {
        return Err(Error::BadFormat);
    }

    offset += COFF_HEADER_SIZE;

    if pe.coff.size_of_optional_header != 0 {
        let magic = Magic::from_u16(read_u16(binary, offset)?).ok_or(Error::BadFormat)?;

        match magic {
            Magic::PE32 => {
                pe.optional_header_32 = Some(OptionalHeader32::parse_optional_header(binary, &mut offset)?);
            }
            Magic::PE64 => {
                pe.optional_header_64 = Some(OptionalHeader64::parse_optional_header(binary, &mut offset)?);
            }
        }
    } else {
        return Err(Error::BadFormat);
    }

    if pe.section_alignment() & 1 != 0 {
        // Only section alignments that are a multiple of 2 are supported.
        return Err(Error::BadFormat);
    }

    pe.section_table = parse_section_table(binary, offset, pe.coff.number_of_sections);
    if pe.section_table.len() != pe.coff.number_of_sections as usize {
        return Err(Error::InvalidData);
    }

    Ok(pe)
}

/// Returns the [`MachineTypes`] value that matches the architecture this
/// crate was compiled for — the only machine type the Header Validator
/// accepts, per spec.
fn host_machine_type() -> MachineTypes {
    #[cfg(target_pointer_width = "64")]
    {
        MachineTypes::AMD64
    }
    #[cfg(not(target_pointer_width = "64"))]
    {
        MachineTypes::I386
    }
}

#[repr(C)]
struct DosHeader {
    _pad: [u8; 64],
}

fn read_u16(binary: &[u8], offset: usize) -> Result<u16, Error> {
    let slice = binary.get(offset..offset + 2).ok_or(Error::InvalidData)?;
    Ok(u16::from_le_bytes(slice.try_into().expect("slice is 2 bytes")))
}

fn read_u32(binary: &[u8], offset: usize) -> Result<u32, Error> {
    let slice = binary.get(offset..offset + 4).ok_or(Error::InvalidData)?;
    Ok(u32::from_le_bytes(slice.try_into().expect("slice is 4 bytes")))
}

impl fmt::Display for PortableExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.coff)?;

        if let Some(header) = self.optional_header_32 {
            writeln!(f, "{}", header)?;
        }

        if let Some(header) = self.optional_header_64 {
            writeln!(f, "{}", header)?;
        }

        for section in self.section_table.iter() {
            writeln!(f, "{}", section)?;
        }

        Ok(())
    }
}
