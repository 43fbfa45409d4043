use crate::error::Error;
use crate::image::ImageView;
use crate::pe::PortableExecutable;
use crate::resolver::ModuleResolver;

const IMPORT_DESCRIPTOR_SIZE: usize = 20;
const ORDINAL_FLAG_32: u64 = 0x8000_0000;
const ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;

/// Import Binder: walks the import directory's array of
/// `IMAGE_IMPORT_DESCRIPTOR`s (terminated by an all-zero entry), loads each
/// named module through `resolver`, and patches the image's import address
/// table with the resolved address of every thunk — by name or, when the
/// high bit of the thunk value is set, by ordinal.
///
/// Mirrors MemoryModule.c's `BuildImportTable`. Every module successfully
/// loaded is appended to `imported_modules` regardless of whether every one
/// of its imports resolves, so the caller can still release them on
/// failure; a symbol that fails to resolve aborts the whole bind with
/// [`Error::SymbolNotFound`].
pub fn bind_imports<R: ModuleResolver>(
    headers: &PortableExecutable,
    image: &mut ImageView,
    resolver: &R,
    imported_modules: &mut Vec<R::Handle>,
) -> Result<(), Error> {
    let directory = headers.data_directories().import_table;
    if directory.size == 0 {
        return Ok(());
    }

    let is_64_bit = headers.optional_header_64.is_some();
    let mut descriptor_offset = directory.virtual_address as usize;

    loop {
        let name_rva = image.read_u32(descriptor_offset + 12)?;
        let first_thunk_rva = image.read_u32(descriptor_offset + 16)?;
        let original_first_thunk_rva = image.read_u32(descriptor_offset)?;

        if name_rva == 0 && first_thunk_rva == 0 && original_first_thunk_rva == 0 {
            break;
        }

        let module_name = image.read_c_str(name_rva as usize)?;
        let handle = resolver.load_library(&module_name)?;
        imported_modules.push(handle.clone());

        let thunk_table_rva = if original_first_thunk_rva != 0 {
            original_first_thunk_rva
        } else {
            first_thunk_rva
        };

        bind_thunk_table(image, resolver, handle, thunk_table_rva, first_thunk_rva, is_64_bit)?;

        descriptor_offset += IMPORT_DESCRIPTOR_SIZE;
    }

    Ok(())
}

fn bind_thunk_table<R: ModuleResolver>(
    image: &mut ImageView,
    resolver: &R,
    module: R::Handle,
    thunk_table_rva: u32,
    iat_rva: u32,
    is_64_bit: bool,
) -> Result<(), Error> {
    let thunk_size: usize = if is_64_bit { 8 } else { 4 };
    let ordinal_flag = if is_64_bit { ORDINAL_FLAG_64 } else { ORDINAL_FLAG_32 };

    let mut i = 0usize;
    loop {
        let thunk_offset = thunk_table_rva as usize + i * thunk_size;
        let thunk = if is_64_bit {
            image.read_u64(thunk_offset)?
        } else {
            image.read_u32(thunk_offset)? as u64
        };

        if thunk == 0 {
            break;
        }

        let address = if thunk & ordinal_flag != 0 {
            let ordinal = (thunk & 0xffff) as u16;
            resolver.get_proc_address_by_ordinal(module.clone(), ordinal)?
        } else {
            // IMAGE_IMPORT_BY_NAME: a u16 Hint followed by the NUL-terminated name.
            let name = image.read_c_str(thunk as usize + 2)?;
            resolver.get_proc_address(module.clone(), &name)?
        };

        let iat_offset = iat_rva as usize + i * thunk_size;
        image.write_uptr(iat_offset, address as u64, is_64_bit)?;

        i += 1;
    }

    Ok(())
}
