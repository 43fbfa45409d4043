use crate::coff::Characteristics;
use crate::entry::{call_entry, resolve_entry_point, DLL_PROCESS_ATTACH};
use crate::error::Error;
use crate::image::ImageView;
use crate::imports::bind_imports;
use crate::finalize::finalize_sections;
use crate::module::Module;
use crate::pe::{parse_portable_executable, PortableExecutable};
use crate::relocate::relocate;
use crate::resolver::ModuleResolver;
use crate::sections::materialize_sections;
use crate::tls::invoke_tls_callbacks;
use crate::vm::VirtualMemoryService;

/// Image Layout Planner / Image Allocator / pipeline orchestration: loads a
/// PE image out of `source` the same way MemoryModule.c's
/// `MemoryLoadLibraryEx` does, running every stage of the pipeline in order —
/// validate, reserve, commit headers, copy in sections, relocate, bind
/// imports, finalize section protection, run TLS callbacks, and, for a DLL,
/// dispatch `DLL_PROCESS_ATTACH`.
///
/// An EXE's entry point is resolved but never called automatically; once
/// `load` returns, call [`Module::call_entry`] to hand off control, mirroring
/// MemoryModule.c's separate `MemoryCallEntryPoint` step.
///
/// Any failure after memory has been reserved tears the partially built
/// module down before returning — callers never observe a leaked
/// reservation, imported module, or half-initialized DLL.
pub fn load<V: VirtualMemoryService, R: ModuleResolver>(
    source: &[u8],
    vm: V,
    resolver: R,
) -> Result<Module<V, R>, Error> {
    let headers = parse_portable_executable(source)?;
    let page_size = vm.page_size();
    let image_size = planned_image_size(&headers, page_size)?;

    let preferred_base = headers.image_base();
    let base = vm.reserve(preferred_base, image_size)?;
    let delta = base as i64 - preferred_base as i64;
    let is_dll = headers.is_dll();

    log::debug!(
        "reserved {image_size:#x} bytes at {base:p} (preferred base {preferred_base:#x}, delta {delta:#x})"
    );

    let mut module = Module {
        vm,
        resolver,
        image: unsafe { ImageView::new(base, image_size) },
        headers,
        imported_modules: Vec::new(),
        is_dll,
        is_relocated: delta != 0,
        initialized: false,
        page_size,
    };

    if let Err(err) = run_pipeline(&mut module, source, delta) {
        log::warn!("aborting load: {err}");
        // `module`'s Drop impl releases whatever imports were already bound
        // and frees the reservation before this error propagates.
        return Err(err);
    }

    Ok(module)
}

fn run_pipeline<V: VirtualMemoryService, R: ModuleResolver>(
    module: &mut Module<V, R>,
    source: &[u8],
    delta: i64,
) -> Result<(), Error> {
    let headers_size = module.headers.size_of_headers() as usize;
    let header_bytes = source.get(..headers_size.min(source.len())).ok_or(Error::InvalidData)?;
    module.image.write_bytes(0, header_bytes)?;
    let load_base = module.image.base() as u64;
    patch_image_base(&mut module.image, &module.headers, load_base)?;

    materialize_sections(source, &module.headers, &mut module.image)?;

    if delta != 0 {
        let characteristics = module
            .headers
            .coff
            .get_characteristics()
            .unwrap_or_else(Characteristics::empty);
        if characteristics.contains(Characteristics::IMAGE_FILE_RELOCS_STRIPPED) {
            log::warn!("image needs relocation by {delta:#x} but carries no relocation table");
            return Err(Error::BadFormat);
        }
        log::debug!("relocating image by {delta:#x}");
        relocate(&module.headers, &mut module.image, delta)?;
    }

    bind_imports(&module.headers, &mut module.image, &module.resolver, &mut module.imported_modules)?;
    log::debug!("bound {} imported module(s)", module.imported_modules.len());
    finalize_sections(&module.headers, module.image.base(), &module.vm)?;

    let image_base = module.image.base() as u64;
    unsafe {
        invoke_tls_callbacks(&module.headers, &module.image, image_base, DLL_PROCESS_ATTACH)?;
    }

    if module.is_dll {
        let entry = resolve_entry_point(&module.image, module.headers.address_of_entry_point(), true)?;
        unsafe {
            call_entry(&entry, module.image.base(), DLL_PROCESS_ATTACH)?;
        }
    }
    module.initialized = module.is_dll;

    Ok(())
}

/// NT header offset of `OptionalHeader.ImageBase` relative to the start of
/// the optional header itself: magic/linker-version/SizeOfCode/
/// SizeOfInitializedData/SizeOfUninitializedData/AddressOfEntryPoint/
/// BaseOfCode, plus (PE32 only) BaseOfData.
const IMAGE_BASE_OFFSET_PE32: usize = 28;
const IMAGE_BASE_OFFSET_PE64: usize = 24;
const COFF_HEADER_SIZE: usize = 20;

/// Patches the in-image `OptionalHeader.ImageBase` to `base`, the address
/// the image was actually reserved at, mirroring MemoryModule.c's
/// `MemoryLoadLibraryEx` setting `result->headers->OptionalHeader.ImageBase
/// = (POINTER_TYPE)code` right after copying the headers in — without this,
/// a loaded module introspecting its own header would see the stale
/// preferred base instead of where it actually ended up.
fn patch_image_base(image: &mut ImageView, headers: &PortableExecutable, base: u64) -> Result<(), Error> {
    let e_lfanew = image.read_u32(0x3c)? as usize;
    let optional_header_offset = e_lfanew + 4 + COFF_HEADER_SIZE;

    if headers.optional_header_64.is_some() {
        image.write_u64(optional_header_offset + IMAGE_BASE_OFFSET_PE64, base)
    } else {
        image.write_u32(optional_header_offset + IMAGE_BASE_OFFSET_PE32, base as u32)
    }
}

/// Image Layout Planner: computes the image's footprint from the section
/// table and cross-checks it against the declared `SizeOfImage`.
///
/// Per section, `effective_size` is `SizeOfRawData` when nonzero, else
/// `SectionAlignment` (a section with no raw data still reserves at least
/// one alignment unit of virtual space — `.bss`-style sections). The
/// resulting `last_section_end`, rounded up to a page, must equal
/// `SizeOfImage` rounded up to a page; a mismatch means the header lied
/// about how big the image is, which is exactly the malformed-header case
/// this check guards against, so it is rejected with [`Error::BadFormat`]
/// rather than silently over-allocating.
fn planned_image_size(headers: &PortableExecutable, page_size: usize) -> Result<usize, Error> {
    let alignment = headers.section_alignment().max(1) as usize;
    let mut last_section_end = headers.size_of_headers() as usize;

    for section in &headers.section_table {
        let effective_size = if section.size_of_raw_data != 0 {
            section.size_of_raw_data as usize
        } else {
            alignment
        };
        let end = section.virtual_address as usize + effective_size;
        if end > last_section_end {
            last_section_end = end;
        }
    }

    let aligned_image_size = round_up(headers.size_of_image() as usize, page_size.max(1));
    if round_up(last_section_end, page_size.max(1)) != aligned_image_size {
        log::warn!(
            "section table implies an image footprint of {:#x} bytes but SizeOfImage rounds to {aligned_image_size:#x}",
            round_up(last_section_end, page_size.max(1))
        );
        return Err(Error::BadFormat);
    }

    Ok(aligned_image_size)
}

fn round_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}
