use crate::entry::{call_entry, resolve_entry_point, DLL_PROCESS_DETACH};
use crate::error::Error;
use crate::exports::ExportDirectory;
use crate::image::ImageView;
use crate::pe::PortableExecutable;
use crate::resolver::ModuleResolver;
use crate::resource::{find_resource, load_string_ex, ResourceData, ResourceId};
use crate::vm::VirtualMemoryService;

/// A key passed to [`Module::get_proc_address`]: either an exported name or
/// a raw ordinal, the same two forms `GetProcAddress`/`MAKEINTRESOURCE`
/// accept.
#[derive(Debug, Clone)]
pub enum ProcKey {
    /// Look the export up by name, case-insensitively.
    Name(String),
    /// Look the export up by ordinal.
    Ordinal(u16),
}

impl From<&str> for ProcKey {
    fn from(name: &str) -> Self {
        ProcKey::Name(name.to_string())
    }
}

impl From<u16> for ProcKey {
    fn from(ordinal: u16) -> Self {
        ProcKey::Ordinal(ordinal)
    }
}

/// A type signature compatible with `DllMain`/`DllEntryPoint`:
/// `BOOL DllMain(HINSTANCE hinstDLL, DWORD fdwReason, LPVOID lpvReserved)`.
pub type DllEntryFn = unsafe extern "system" fn(*mut core::ffi::c_void, u32, *mut core::ffi::c_void) -> i32;

/// A type signature compatible with a plain EXE entry point:
/// `int mainCRTStartup(void)` and friends — MemoryModule.c always calls it
/// as a zero-argument function returning an `int`.
pub type ExeEntryFn = unsafe extern "system" fn() -> i32;

/// The resolved entry point of a loaded image, or the absence of one (a DLL
/// with `AddressOfEntryPoint == 0` is valid and simply never runs
/// initialization code).
pub enum EntryPoint {
    /// No entry point: `AddressOfEntryPoint` was zero.
    None,
    /// A DLL entry point, invoked once per attach/detach reason.
    Dll(DllEntryFn),
    /// An EXE entry point, invoked once with no arguments.
    Exe(ExeEntryFn),
}

/// A loaded image and everything the loader needs to keep it running and,
/// eventually, tear it down: the committed memory it lives in, the imports
/// it pulled in (so they can be released), and the bookkeeping flags the
/// pipeline's later stages (Relocator, TLS Invoker, Entry-Point Dispatcher)
/// read and set as they run.
///
/// Generic over the virtual memory service and module resolver so that
/// tests can plug in [`crate::vm::HeapBackedVm`] and
/// [`crate::resolver::StubResolver`] instead of touching the real OS.
pub struct Module<V: VirtualMemoryService, R: ModuleResolver> {
    pub(crate) vm: V,
    pub(crate) resolver: R,
    /// View over the image's committed memory, rooted at its (possibly
    /// relocated) load address.
    pub(crate) image: ImageView,
    /// Parsed headers, read from the original input buffer during
    /// validation — kept around for section/import/relocation/resource
    /// lookups rather than re-parsed out of the copied-in-place headers.
    pub(crate) headers: PortableExecutable,
    /// Handles of modules pulled in by the Import Binder, released by
    /// [`Drop`] in the same order they were acquired.
    pub(crate) imported_modules: Vec<R::Handle>,
    /// Whether [`crate::coff::Characteristics::IMAGE_FILE_DLL`] is set.
    pub(crate) is_dll: bool,
    /// Whether the Relocator ran a non-trivial pass (the preferred base
    /// could not be honored). An EXE that was *not* relocated is safe to
    /// run its entry point; a relocated EXE with `RELOCS_STRIPPED` refuses
    /// to dispatch per the Header Validator's baseline guarantee.
    pub(crate) is_relocated: bool,
    /// Whether `DLL_PROCESS_ATTACH` has been dispatched successfully.
    pub(crate) initialized: bool,
    /// Host page size, used by the Section Finalizer to group pages.
    pub(crate) page_size: usize,
}

impl<V: VirtualMemoryService, R: ModuleResolver> Module<V, R> {
    /// The image's load address.
    pub fn code_base(&self) -> *mut u8 {
        self.image.base()
    }

    /// The image's committed size in bytes.
    pub fn size_of_image(&self) -> usize {
        self.image.len()
    }

    /// Whether this image is a DLL (`false` means a plain EXE).
    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    /// Whether `DLL_PROCESS_ATTACH` has already run to completion.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The parsed headers this module was loaded from.
    pub fn headers(&self) -> &PortableExecutable {
        &self.headers
    }

    /// Export Resolver: resolves a symbol exported by this image itself, by
    /// name or ordinal, the in-memory equivalent of calling `GetProcAddress`
    /// against a normally loaded module. Returns the resolved address within
    /// the image, not a typed function pointer — callers transmute it to the
    /// signature they know the export has.
    pub fn get_proc_address(&self, key: impl Into<ProcKey>) -> Result<*const u8, Error> {
        let directory = ExportDirectory::parse(&self.headers, &self.image)?.ok_or(Error::SymbolNotFound)?;
        let rva = match key.into() {
            ProcKey::Name(name) => directory.resolve_name(&name)?,
            ProcKey::Ordinal(ordinal) => directory.resolve_ordinal(ordinal)?,
        };
        self.image.ptr_at(rva as usize).map(|p| p as *const u8)
    }

    /// Resource Directory Walker: `FindResource`/`FindResourceEx` —
    /// descends the type/name/language tree and returns a handle to the
    /// matching data entry's size and location, without copying anything
    /// out of the image.
    pub fn find_resource(
        &self,
        res_type: impl Into<ResourceId>,
        name: impl Into<ResourceId>,
        language: Option<u16>,
    ) -> Result<ResourceData, Error> {
        find_resource(&self.headers, &self.image, res_type.into(), name.into(), language)
    }

    /// `SizeofResource`: the size in bytes of a resource previously located
    /// with [`Module::find_resource`].
    pub fn sizeof_resource(&self, resource: &ResourceData) -> u32 {
        resource.size
    }

    /// `LoadResource`: the address of a resource's raw bytes within the
    /// loaded image, previously located with [`Module::find_resource`].
    pub fn load_resource(&self, resource: &ResourceData) -> Result<*const u8, Error> {
        self.image.ptr_at(resource.rva as usize).map(|p| p as *const u8)
    }

    /// `LoadStringEx`: the string with identifier `id` out of this image's
    /// `RT_STRING` resources, in the given language (or the thread-default
    /// fallback if that language isn't present).
    pub fn load_string_ex(&self, id: u16, language: u16) -> Result<String, Error> {
        load_string_ex(&self.headers, &self.image, id, language)
    }

    /// `LoadString`: [`Module::load_string_ex`] with the default language.
    pub fn load_string(&self, id: u16) -> Result<String, Error> {
        self.load_string_ex(id, crate::resource::DEFAULT_LANGUAGE)
    }

    /// Calls the image's entry point as a plain EXE entry point: no reason
    /// code, called exactly once, return value handed back to the caller
    /// as the process's would-be exit code. Mirrors the second half of
    /// MemoryModule.c's two-step `MemoryLoadLibrary`/`MemoryCallEntryPoint`
    /// contract for non-DLL images; [`load`](crate::loader::load) never
    /// calls this automatically.
    ///
    /// Mirrors `MemoryCallEntryPoint`'s own guard: returns `-1` without
    /// touching the image if this module is a DLL, was never successfully
    /// relocated, or has no entry point at all, rather than invoking
    /// `DllMain` a second time or calling through a null/unrelocated
    /// address.
    pub fn call_entry(&self) -> Result<i32, Error> {
        if self.is_dll || !self.is_relocated {
            return Ok(-1);
        }
        let entry = resolve_entry_point(&self.image, self.headers.address_of_entry_point(), self.is_dll)?;
        if matches!(entry, EntryPoint::None) {
            return Ok(-1);
        }
        unsafe { call_entry(&entry, self.image.base(), 0) }
    }

    /// Dispatches `DLL_PROCESS_DETACH` to a DLL's entry point, if one was
    /// successfully initialized. Called automatically by [`Drop`] so a
    /// [`Module`] going out of scope behaves like `FreeLibrary`, but exposed
    /// here so callers can observe a failed detach notification instead of
    /// having it silently swallowed during teardown.
    pub fn notify_process_detach(&mut self) -> Result<(), Error> {
        if !self.is_dll || !self.initialized {
            return Ok(());
        }
        let entry = resolve_entry_point(&self.image, self.headers.address_of_entry_point(), true)?;
        self.initialized = false;
        unsafe { call_entry(&entry, self.image.base(), DLL_PROCESS_DETACH) }.map(|_| ())
    }
}

impl<V: VirtualMemoryService, R: ModuleResolver> Drop for Module<V, R> {
    fn drop(&mut self) {
        if let Err(err) = self.notify_process_detach() {
            log::warn!("DLL_PROCESS_DETACH notification failed: {err}");
        }
        for handle in self.imported_modules.drain(..) {
            self.resolver.free_library(handle);
        }
        if !self.image.base().is_null() {
            self.vm.free(self.image.base());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageView;
    use crate::pe::parse_portable_executable;
    use crate::resolver::StubResolver;
    use crate::testutil::build_minimal_pe;
    use crate::vm::HeapBackedVm;

    fn module_from(built: &crate::testutil::BuiltPe, is_dll: bool, is_relocated: bool) -> Module<HeapBackedVm, StubResolver> {
        let headers = parse_portable_executable(&built.bytes).unwrap();
        let mut backing = built.bytes.clone();
        backing.resize(backing.len().max(headers.size_of_image() as usize), 0);
        let image = unsafe { ImageView::new(Box::leak(backing.into_boxed_slice()).as_mut_ptr(), headers.size_of_image() as usize) };
        Module {
            vm: HeapBackedVm::default(),
            resolver: StubResolver::new(),
            image,
            headers,
            imported_modules: Vec::new(),
            is_dll,
            is_relocated,
            initialized: false,
            page_size: 0x1000,
        }
    }

    #[test]
    fn call_entry_on_dll_returns_negative_one() {
        let built = build_minimal_pe();
        let module = module_from(&built, true, true);
        assert_eq!(module.call_entry().unwrap(), -1);
    }

    #[test]
    fn call_entry_on_unrelocated_module_returns_negative_one() {
        let built = build_minimal_pe();
        let module = module_from(&built, false, false);
        assert_eq!(module.call_entry().unwrap(), -1);
    }

    #[test]
    fn call_entry_with_no_entry_point_returns_negative_one() {
        let mut built = build_minimal_pe();
        let off = built.optional_header_offset + 16;
        built.bytes[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
        let module = module_from(&built, false, true);
        assert_eq!(module.call_entry().unwrap(), -1);
    }

    fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a module backed by a hand-laid-out export directory exporting
    /// `"Add"` (ordinal base 1) at RVA `0x2000`, exercising
    /// `Module::get_proc_address` end to end rather than just
    /// `ExportDirectory`'s field-offset math.
    fn module_with_export() -> Module<HeapBackedVm, StubResolver> {
        let mut bytes = vec![0u8; 8192];
        let dir_rva = 0x100u32;
        put_u32(&mut bytes, dir_rva as usize + 16, 1); // Base
        put_u32(&mut bytes, dir_rva as usize + 20, 1); // NumberOfFunctions
        put_u32(&mut bytes, dir_rva as usize + 24, 1); // NumberOfNames
        put_u32(&mut bytes, dir_rva as usize + 28, 0x140); // AddressOfFunctions
        put_u32(&mut bytes, dir_rva as usize + 32, 0x148); // AddressOfNames
        put_u32(&mut bytes, dir_rva as usize + 36, 0x14c); // AddressOfNameOrdinals
        put_u32(&mut bytes, 0x140, 0x2000);
        put_u32(&mut bytes, 0x148, 0x160);
        put_u16(&mut bytes, 0x14c, 0);
        bytes[0x160..0x164].copy_from_slice(b"Add\0");

        let headers = crate::pe::PortableExecutable {
            coff: crate::coff::CoffFileHeader::default(),
            optional_header_32: None,
            optional_header_64: Some(crate::optional::OptionalHeader64 {
                data_directories: crate::optional::DataDirectories {
                    export_table: crate::optional::DataDirectory { virtual_address: dir_rva, size: 0x100 },
                    ..Default::default()
                },
                ..Default::default()
            }),
            section_table: Vec::new(),
        };

        let image = unsafe { ImageView::new(Box::leak(bytes.into_boxed_slice()).as_mut_ptr(), 8192) };
        Module {
            vm: HeapBackedVm::default(),
            resolver: StubResolver::new(),
            image,
            headers,
            imported_modules: Vec::new(),
            is_dll: true,
            is_relocated: true,
            initialized: false,
            page_size: 0x1000,
        }
    }

    #[test]
    fn get_proc_address_resolves_by_name_and_ordinal() {
        let module = module_with_export();
        let by_name = module.get_proc_address("Add").unwrap();
        let by_ordinal = module.get_proc_address(1u16).unwrap();
        assert_eq!(by_name, module.code_base().wrapping_add(0x2000) as *const u8);
        assert_eq!(by_name, by_ordinal);
        assert!(matches!(module.get_proc_address("Missing"), Err(Error::SymbolNotFound)));
    }

    /// Builds a module backed by a hand-laid-out three-level resource
    /// directory (type `RT_STRING` -> id 1 -> language 0) carrying one
    /// string table resource with two packed strings ("alpha" at slot 1,
    /// "beta" at slot 2), exercising `find_resource`/`load_string` together.
    fn module_with_string_table() -> Module<HeapBackedVm, StubResolver> {
        let mut bytes = vec![0u8; 8192];
        let root = 0x1000usize;

        put_u16(&mut bytes, root + 14, 1);
        put_u32(&mut bytes, root + 16, crate::resource::RT_STRING as u32);
        let name_dir = root + 0x20;
        put_u32(&mut bytes, root + 20, 0x8000_0000 | (name_dir - root) as u32);

        // Table id 1 (strings 0-15), so ids 1 ("alpha") and 2 ("beta") live here.
        put_u16(&mut bytes, name_dir + 14, 1);
        put_u32(&mut bytes, name_dir + 16, 1);
        let lang_dir = root + 0x40;
        put_u32(&mut bytes, name_dir + 20, 0x8000_0000 | (lang_dir - root) as u32);

        put_u16(&mut bytes, lang_dir + 14, 1);
        put_u32(&mut bytes, lang_dir + 16, 0);
        let data_entry = root + 0x60;
        put_u32(&mut bytes, lang_dir + 20, (data_entry - root) as u32);

        // Slot 0 (id 0, unused) is a zero-length placeholder; id 1 ("alpha")
        // and id 2 ("beta") occupy slots 1 and 2 of this 16-string table.
        let strings_rva = 0x1800u32;
        let mut offset = strings_rva as usize;
        let start = offset;
        put_u16(&mut bytes, offset, 0);
        offset += 2;
        let alpha: Vec<u16> = "alpha".encode_utf16().collect();
        put_u16(&mut bytes, offset, alpha.len() as u16);
        offset += 2;
        for unit in &alpha {
            bytes[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            offset += 2;
        }
        let beta: Vec<u16> = "beta".encode_utf16().collect();
        put_u16(&mut bytes, offset, beta.len() as u16);
        offset += 2;
        for unit in &beta {
            bytes[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            offset += 2;
        }
        put_u32(&mut bytes, data_entry, strings_rva);
        put_u32(&mut bytes, data_entry + 4, (offset - start) as u32);

        let headers = crate::pe::PortableExecutable {
            coff: crate::coff::CoffFileHeader::default(),
            optional_header_32: None,
            optional_header_64: Some(crate::optional::OptionalHeader64 {
                data_directories: crate::optional::DataDirectories {
                    resource_table: crate::optional::DataDirectory { virtual_address: root as u32, size: 0x100 },
                    ..Default::default()
                },
                ..Default::default()
            }),
            section_table: Vec::new(),
        };

        let image = unsafe { ImageView::new(Box::leak(bytes.into_boxed_slice()).as_mut_ptr(), 8192) };
        Module {
            vm: HeapBackedVm::default(),
            resolver: StubResolver::new(),
            image,
            headers,
            imported_modules: Vec::new(),
            is_dll: true,
            is_relocated: true,
            initialized: false,
            page_size: 0x1000,
        }
    }

    #[test]
    fn find_resource_and_load_string_round_trip() {
        let module = module_with_string_table();

        let data = module.find_resource(crate::resource::RT_STRING, 1u16, Some(0)).unwrap();
        assert_eq!(module.sizeof_resource(&data), data.size);
        assert!(!module.load_resource(&data).unwrap().is_null());

        assert_eq!(module.load_string(1).unwrap(), "alpha");
        assert_eq!(module.load_string_ex(2, 0).unwrap(), "beta");
        // id 3 falls past this table's last populated slot; the walk lands
        // exactly on the entry's declared end with nothing left to read.
        assert_eq!(module.load_string(3).unwrap(), "");
    }
}
