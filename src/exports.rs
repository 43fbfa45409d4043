use crate::error::Error;
use crate::image::ImageView;
use crate::pe::PortableExecutable;

/// Export Resolver: looks up a symbol in an image's own export directory —
/// the in-memory equivalent of `GetProcAddress` against a normally loaded
/// module — by name or by ordinal.
///
/// Mirrors MemoryModule.c's `MemoryGetProcAddress`: a directory with no
/// names or no functions is rejected up front regardless of lookup kind;
/// names are looked up with a linear scan over `AddressOfNames` (the
/// original does a plain `_stricmp` loop, not a binary search — the table
/// is usually sorted, but nothing here depends on that), then mapped
/// through `AddressOfNameOrdinals` to an index into `AddressOfFunctions`.
/// Forwarder exports — an RVA that itself points back inside the export
/// directory, naming another DLL's export instead of an address — are
/// detected but not chased further, and surface as
/// [`Error::SymbolNotFound`].
pub struct ExportDirectory<'a> {
    image: &'a ImageView,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: usize,
    address_of_names: usize,
    address_of_name_ordinals: usize,
    directory_start: usize,
    directory_end: usize,
}

impl<'a> ExportDirectory<'a> {
    /// Parses the export directory, if this image has one.
    pub fn parse(headers: &PortableExecutable, image: &'a ImageView) -> Result<Option<Self>, Error> {
        let directory = headers.data_directories().export_table;
        if directory.size == 0 {
            return Ok(None);
        }

        let rva = directory.virtual_address as usize;
        Ok(Some(Self {
            image,
            base: image.read_u32(rva + 16)?,
            number_of_functions: image.read_u32(rva + 20)?,
            number_of_names: image.read_u32(rva + 24)?,
            address_of_functions: image.read_u32(rva + 28)? as usize,
            address_of_names: image.read_u32(rva + 32)? as usize,
            address_of_name_ordinals: image.read_u32(rva + 36)? as usize,
            directory_start: rva,
            directory_end: rva + directory.size as usize,
        }))
    }

    fn function_rva(&self, index: u32) -> Result<u32, Error> {
        self.image.read_u32(self.address_of_functions + index as usize * 4)
    }

    fn reject_forwarder(&self, function_rva: u32) -> Result<u32, Error> {
        let rva = function_rva as usize;
        if rva >= self.directory_start && rva < self.directory_end {
            Err(Error::SymbolNotFound)
        } else {
            Ok(function_rva)
        }
    }

    /// A directory with no exported names or no exported functions answers
    /// every lookup with [`Error::SymbolNotFound`], checked before either
    /// lookup kind runs its own logic, matching `MemoryGetProcAddress`'s
    /// upfront `NumberOfNames == 0 || NumberOfFunctions == 0` guard.
    fn reject_if_empty(&self) -> Result<(), Error> {
        if self.number_of_names == 0 || self.number_of_functions == 0 {
            Err(Error::SymbolNotFound)
        } else {
            Ok(())
        }
    }

    /// Resolves `ordinal` (the biased ordinal as it appears in an import
    /// thunk, or as passed to `GetProcAddress` via `MAKEINTRESOURCE`) to an
    /// RVA within this image.
    ///
    /// The bound check is strictly-greater, matching `MemoryGetProcAddress`'s
    /// `if (idx > exports->NumberOfFunctions)` rather than a `>=` guard — at
    /// `index == number_of_functions` this lets the read through exactly as
    /// the original does, rather than rejecting an ordinal the original
    /// would have serviced.
    pub fn resolve_ordinal(&self, ordinal: u16) -> Result<u32, Error> {
        self.reject_if_empty()?;
        let index = (ordinal as u32).checked_sub(self.base).ok_or(Error::SymbolNotFound)?;
        if index > self.number_of_functions {
            return Err(Error::SymbolNotFound);
        }
        self.reject_forwarder(self.function_rva(index)?)
    }

    /// Resolves `name` to an RVA within this image via a linear scan over
    /// `AddressOfNames`, the same loop `MemoryGetProcAddress` runs — not a
    /// binary search, since the original never assumes the name table is
    /// sorted. The comparison is case-insensitive, matching its use of
    /// `_stricmp`.
    pub fn resolve_name(&self, name: &str) -> Result<u32, Error> {
        self.reject_if_empty()?;
        for i in 0..self.number_of_names {
            let name_rva = self.image.read_u32(self.address_of_names + i as usize * 4)?;
            let candidate = self.image.read_c_str(name_rva as usize)?;
            if candidate.eq_ignore_ascii_case(name) {
                let name_ordinal = self.image.read_u16(self.address_of_name_ordinals + i as usize * 2)?;
                return self.reject_forwarder(self.function_rva(name_ordinal as u32)?);
            }
        }

        Err(Error::SymbolNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a synthetic export directory exporting `"Add"` (ordinal base
    /// 1) at RVA `0x2000`, with a single name entry.
    fn build_export_fixture() -> Vec<u8> {
        let mut bytes = vec![0u8; 4096];
        let dir_rva = 0x100usize;
        let functions_rva = 0x140usize;
        let names_rva = 0x148usize;
        let ordinals_rva = 0x14cusize;
        let name_str_rva = 0x160usize;

        bytes[dir_rva + 16..dir_rva + 20].copy_from_slice(&1u32.to_le_bytes()); // Base
        bytes[dir_rva + 20..dir_rva + 24].copy_from_slice(&1u32.to_le_bytes()); // NumberOfFunctions
        bytes[dir_rva + 24..dir_rva + 28].copy_from_slice(&1u32.to_le_bytes()); // NumberOfNames
        bytes[dir_rva + 28..dir_rva + 32].copy_from_slice(&(functions_rva as u32).to_le_bytes());
        bytes[dir_rva + 32..dir_rva + 36].copy_from_slice(&(names_rva as u32).to_le_bytes());
        bytes[dir_rva + 36..dir_rva + 40].copy_from_slice(&(ordinals_rva as u32).to_le_bytes());

        bytes[functions_rva..functions_rva + 4].copy_from_slice(&0x2000u32.to_le_bytes());
        bytes[names_rva..names_rva + 4].copy_from_slice(&(name_str_rva as u32).to_le_bytes());
        bytes[ordinals_rva..ordinals_rva + 2].copy_from_slice(&0u16.to_le_bytes());
        bytes[name_str_rva..name_str_rva + 4].copy_from_slice(b"Add\0");

        bytes
    }

    #[test]
    fn resolves_by_name_and_ordinal() {
        let mut bytes = build_export_fixture();
        let image = unsafe { ImageView::new(bytes.as_mut_ptr(), bytes.len()) };

        // Construct the directory by hand: `ExportDirectory::parse` needs a
        // `PortableExecutable`, which this focused test skips in favor of
        // exercising the field-offset math directly against the fixture.
        let directory = ExportDirectory {
            image: &image,
            base: 1,
            number_of_functions: 1,
            number_of_names: 1,
            address_of_functions: 0x140,
            address_of_names: 0x148,
            address_of_name_ordinals: 0x14c,
            directory_start: 0x100,
            directory_end: 0x200,
        };

        assert_eq!(directory.resolve_name("Add").unwrap(), 0x2000);
        assert_eq!(directory.resolve_name("ADD").unwrap(), 0x2000);
        assert_eq!(directory.resolve_name("add").unwrap(), 0x2000);
        assert_eq!(directory.resolve_ordinal(1).unwrap(), 0x2000);
        assert!(matches!(directory.resolve_name("Missing"), Err(Error::SymbolNotFound)));
        assert!(matches!(directory.resolve_ordinal(99), Err(Error::SymbolNotFound)));
    }

    #[test]
    fn resolve_ordinal_lets_the_boundary_ordinal_through() {
        // `base + number_of_functions` is one past the last real ordinal;
        // the original's `>` bound check (not `>=`) lets it through to an
        // out-of-bounds-by-one read of `AddressOfFunctions`, which lands on
        // this fixture's zero-initialized padding rather than erroring.
        let mut bytes = build_export_fixture();
        let image = unsafe { ImageView::new(bytes.as_mut_ptr(), bytes.len()) };
        let directory = ExportDirectory {
            image: &image,
            base: 1,
            number_of_functions: 1,
            number_of_names: 1,
            address_of_functions: 0x140,
            address_of_names: 0x148,
            address_of_name_ordinals: 0x14c,
            directory_start: 0x100,
            directory_end: 0x200,
        };

        assert_eq!(directory.resolve_ordinal(2).unwrap(), 0);
        assert!(matches!(directory.resolve_ordinal(3), Err(Error::SymbolNotFound)));
    }
}
