//! End-to-end scenarios against the real Windows virtual-memory and module
//! resolver backends, exercising actual generated machine code rather than
//! the software-only `HeapBackedVm`/`StubResolver` pair the in-crate unit
//! tests use. Mirrors spec scenarios S1 (export call) and S4 (EXE entry
//! point), which only make sense once the loaded bytes are truly executable.
#![cfg(windows)]

use memload::resolver::WindowsModuleResolver;
use memload::vm::WindowsVirtualMemory;

const DOS_HEADER_SIZE: usize = 0x40;
const NT_SIGNATURE_OFFSET: usize = DOS_HEADER_SIZE;
const COFF_HEADER_OFFSET: usize = NT_SIGNATURE_OFFSET + 4;
const COFF_HEADER_SIZE: usize = 20;
const OPTIONAL_HEADER_OFFSET: usize = COFF_HEADER_OFFSET + COFF_HEADER_SIZE;
const OPTIONAL_HEADER64_SIZE: usize = 240;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
const IMAGE_FILE_DLL: u16 = 0x2000;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;

fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Lays down the DOS/NT/COFF/optional headers and a single executable
/// section common to both scenarios below, returning the buffer and the
/// section's file offset so callers can place their own code/data into it.
fn build_common_headers(image_base: u64, entry_rva: u32, is_dll: bool) -> Vec<u8> {
    let section_file_offset = FILE_ALIGNMENT as usize;
    let section_raw_size = FILE_ALIGNMENT;
    let section_rva = SECTION_ALIGNMENT;
    let size_of_headers = FILE_ALIGNMENT;
    let size_of_image = SECTION_ALIGNMENT * 2;

    let mut bytes = vec![0u8; section_file_offset + section_raw_size as usize];

    put_u16(&mut bytes, 0, 0x5a4d); // "MZ"
    put_u32(&mut bytes, 0x3c, DOS_HEADER_SIZE as u32);
    put_u32(&mut bytes, NT_SIGNATURE_OFFSET, 0x0000_4550);

    let coff = COFF_HEADER_OFFSET;
    put_u16(&mut bytes, coff, 0x8664); // AMD64
    put_u16(&mut bytes, coff + 2, 1); // NumberOfSections
    put_u16(&mut bytes, coff + 16, OPTIONAL_HEADER64_SIZE as u16);
    let mut characteristics = IMAGE_FILE_EXECUTABLE_IMAGE;
    if is_dll {
        characteristics |= IMAGE_FILE_DLL;
    }
    put_u16(&mut bytes, coff + 18, characteristics);

    let opt = OPTIONAL_HEADER_OFFSET;
    put_u16(&mut bytes, opt, 0x20b); // PE32+
    put_u32(&mut bytes, opt + 16, entry_rva);
    put_u32(&mut bytes, opt + 20, section_rva);
    put_u64(&mut bytes, opt + 24, image_base);
    put_u32(&mut bytes, opt + 32, SECTION_ALIGNMENT);
    put_u32(&mut bytes, opt + 36, FILE_ALIGNMENT);
    put_u32(&mut bytes, opt + 56, size_of_image);
    put_u32(&mut bytes, opt + 60, size_of_headers);
    put_u32(&mut bytes, opt + 108, 16); // NumberOfRvaAndSizes

    let sec = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER64_SIZE;
    bytes[sec..sec + 5].copy_from_slice(b".text");
    put_u32(&mut bytes, sec + 8, section_raw_size); // VirtualSize
    put_u32(&mut bytes, sec + 12, section_rva); // VirtualAddress
    put_u32(&mut bytes, sec + 16, section_raw_size); // SizeOfRawData
    put_u32(&mut bytes, sec + 20, section_file_offset as u32); // PointerToRawData
    put_u32(&mut bytes, sec + 36, 0x6000_0020); // CODE | EXECUTE | READ

    bytes
}

fn data_directory_offset(index: usize) -> usize {
    OPTIONAL_HEADER_OFFSET + 112 + index * 8
}

/// S1: loads a minimal DLL exporting `Add(int, int) -> int` by name and
/// confirms `get_proc_address("Add")` resolves to a callable address whose
/// invocation with (2, 3) returns 5. The DLL has no entry point, so load
/// completes without dispatching `DLL_PROCESS_ATTACH`.
#[test]
fn s1_loads_dll_and_calls_exported_function() {
    let section_rva: u32 = SECTION_ALIGNMENT;
    let mut bytes = build_common_headers(0x1_7000_0000, 0, true);

    // x64 Microsoft calling convention: first arg in ecx, second in edx,
    // return in eax. `mov eax, ecx; add eax, edx; ret`.
    let code_rva = section_rva;
    let code_file_offset = FILE_ALIGNMENT as usize;
    bytes[code_file_offset..code_file_offset + 5].copy_from_slice(&[0x8b, 0xc1, 0x03, 0xc2, 0xc3]);

    let export_dir_rva = section_rva + 0x100;
    let functions_rva = section_rva + 0x140;
    let names_rva = section_rva + 0x148;
    let ordinals_rva = section_rva + 0x14c;
    let name_str_rva = section_rva + 0x160;

    let file_of = |rva: u32| -> usize { code_file_offset + (rva - section_rva) as usize };

    put_u32(&mut bytes, file_of(export_dir_rva) + 16, 1); // Base
    put_u32(&mut bytes, file_of(export_dir_rva) + 20, 1); // NumberOfFunctions
    put_u32(&mut bytes, file_of(export_dir_rva) + 24, 1); // NumberOfNames
    put_u32(&mut bytes, file_of(export_dir_rva) + 28, functions_rva);
    put_u32(&mut bytes, file_of(export_dir_rva) + 32, names_rva);
    put_u32(&mut bytes, file_of(export_dir_rva) + 36, ordinals_rva);
    put_u32(&mut bytes, file_of(functions_rva), code_rva);
    put_u32(&mut bytes, file_of(names_rva), name_str_rva);
    put_u16(&mut bytes, file_of(ordinals_rva), 0);
    bytes[file_of(name_str_rva)..file_of(name_str_rva) + 4].copy_from_slice(b"Add\0");

    put_u32(&mut bytes, data_directory_offset(0), export_dir_rva);
    put_u32(&mut bytes, data_directory_offset(0) + 4, 0x100);

    let module = memload::load(&bytes, WindowsVirtualMemory, WindowsModuleResolver)
        .expect("minimal export-only DLL should load");
    assert!(module.is_dll());

    let add = module.get_proc_address("Add").expect("Add should resolve");
    let add: unsafe extern "system" fn(i32, i32) -> i32 = unsafe { core::mem::transmute(add) };
    assert_eq!(unsafe { add(2, 3) }, 5);
}

/// S4: loads an EXE whose entry point returns 42 and confirms
/// `call_entry` returns it; a DLL's `call_entry` always returns -1.
#[test]
fn s4_exe_entry_point_returns_its_value() {
    let section_rva: u32 = SECTION_ALIGNMENT;
    let mut bytes = build_common_headers(0x1_7100_0000, section_rva, false);

    // `mov eax, 42; ret`.
    let code_file_offset = FILE_ALIGNMENT as usize;
    bytes[code_file_offset..code_file_offset + 6].copy_from_slice(&[0xb8, 42, 0, 0, 0, 0xc3]);

    let module = memload::load(&bytes, WindowsVirtualMemory, WindowsModuleResolver)
        .expect("minimal EXE should load");
    assert!(!module.is_dll());
    assert_eq!(module.call_entry().unwrap(), 42);
}

/// Property 2 / S2: when the preferred base is unavailable the image loads
/// at a different address, and an absolute pointer baked into the image
/// (patched by the Relocator) ends up exactly `delta` away from its
/// preferred value — then the same export from S1 is still resolvable and
/// callable at the new base, confirming the relocated reload still works.
#[test]
fn s2_relocated_load_patches_pointer_and_export_still_callable() {
    // The first 64KiB of address space is reserved by the OS as a null-page
    // guard region, so `VirtualAlloc` never honors this as an exact base —
    // the loader always falls back to an OS-chosen address, guaranteeing a
    // nonzero relocation delta.
    let preferred_base: u64 = 0x1_0000;
    let section_rva: u32 = SECTION_ALIGNMENT;
    let mut bytes = build_common_headers(preferred_base, 0, true);
    let code_file_offset = FILE_ALIGNMENT as usize;

    bytes[code_file_offset..code_file_offset + 5].copy_from_slice(&[0x8b, 0xc1, 0x03, 0xc2, 0xc3]);

    let export_dir_rva = section_rva + 0x100;
    let functions_rva = section_rva + 0x140;
    let names_rva = section_rva + 0x148;
    let ordinals_rva = section_rva + 0x14c;
    let name_str_rva = section_rva + 0x160;
    let pointer_rva = section_rva + 0x500;

    let file_of = |rva: u32| -> usize { code_file_offset + (rva - section_rva) as usize };

    put_u32(&mut bytes, file_of(export_dir_rva) + 16, 1);
    put_u32(&mut bytes, file_of(export_dir_rva) + 20, 1);
    put_u32(&mut bytes, file_of(export_dir_rva) + 24, 1);
    put_u32(&mut bytes, file_of(export_dir_rva) + 28, functions_rva);
    put_u32(&mut bytes, file_of(export_dir_rva) + 32, names_rva);
    put_u32(&mut bytes, file_of(export_dir_rva) + 36, ordinals_rva);
    put_u32(&mut bytes, file_of(functions_rva), section_rva);
    put_u32(&mut bytes, file_of(names_rva), name_str_rva);
    put_u16(&mut bytes, file_of(ordinals_rva), 0);
    bytes[file_of(name_str_rva)..file_of(name_str_rva) + 4].copy_from_slice(b"Add\0");
    put_u32(&mut bytes, data_directory_offset(0), export_dir_rva);
    put_u32(&mut bytes, data_directory_offset(0) + 4, 0x100);

    let preferred_pointer_value = preferred_base + 0x9999;
    put_u64(&mut bytes, file_of(pointer_rva), preferred_pointer_value);

    // One base relocation block covering the section's first page: a single
    // DIR64 entry at `pointer_rva`'s in-page offset, padded to a 4-byte
    // block size with an ABSOLUTE entry.
    let reloc_rva = section_rva + 0x600;
    let dir64_entry: u16 = (10u16 << 12) | ((pointer_rva - section_rva) as u16);
    let block_size: u32 = 8 + 2 + 2;
    put_u32(&mut bytes, file_of(reloc_rva), section_rva);
    put_u32(&mut bytes, file_of(reloc_rva) + 4, block_size);
    put_u16(&mut bytes, file_of(reloc_rva) + 8, dir64_entry);
    put_u16(&mut bytes, file_of(reloc_rva) + 10, 0);
    put_u32(&mut bytes, data_directory_offset(5), reloc_rva);
    put_u32(&mut bytes, data_directory_offset(5) + 4, block_size);

    let module = memload::load(&bytes, WindowsVirtualMemory, WindowsModuleResolver)
        .expect("relocatable export-only DLL should load even off its preferred base");

    let delta = module.code_base() as i64 - preferred_base as i64;
    assert_ne!(delta, 0, "preferred base should have been unavailable");

    let patched = unsafe { (module.code_base().add(pointer_rva as usize) as *const u64).read_unaligned() };
    assert_eq!(patched, preferred_pointer_value.wrapping_add(delta as u64));

    let add = module.get_proc_address("Add").expect("Add should still resolve after relocation");
    let add: unsafe extern "system" fn(i32, i32) -> i32 = unsafe { core::mem::transmute(add) };
    assert_eq!(unsafe { add(2, 3) }, 5);
}

/// S3: an import naming a module the resolver cannot load fails the whole
/// load with `ModuleNotFound`, and no memory remains committed afterward
/// (the reservation is released by `Module`'s `Drop`, run automatically
/// when `load` unwinds the partially built module on error).
#[test]
fn s3_unresolvable_import_fails_the_load() {
    let mut bytes = build_common_headers(0x1_7200_0000, 0, true);
    let section_rva: u32 = SECTION_ALIGNMENT;
    let code_file_offset = FILE_ALIGNMENT as usize;

    let descriptor_rva = section_rva + 0x100;
    let name_rva = section_rva + 0x200;
    let int_rva = section_rva + 0x300;
    let iat_rva = section_rva + 0x320;
    let by_name_rva = section_rva + 0x400;

    let file_of = |rva: u32| -> usize { code_file_offset + (rva - section_rva) as usize };

    put_u32(&mut bytes, file_of(descriptor_rva), int_rva);
    put_u32(&mut bytes, file_of(descriptor_rva) + 12, name_rva);
    put_u32(&mut bytes, file_of(descriptor_rva) + 16, iat_rva);
    bytes[file_of(name_rva)..file_of(name_rva) + 18].copy_from_slice(b"NOSUCHMODULE.DLL\0\0");
    bytes[file_of(by_name_rva) + 2..file_of(by_name_rva) + 2 + 8].copy_from_slice(b"DoThing\0");
    put_u64(&mut bytes, file_of(int_rva), by_name_rva as u64);
    put_u64(&mut bytes, file_of(int_rva) + 8, 0);

    put_u32(&mut bytes, data_directory_offset(1), descriptor_rva);
    put_u32(&mut bytes, data_directory_offset(1) + 4, 20);

    let err = memload::load(&bytes, WindowsVirtualMemory, WindowsModuleResolver)
        .expect_err("nonexistent import should fail the load");
    assert!(matches!(err, memload::Error::ModuleNotFound));
}
