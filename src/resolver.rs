use crate::error::Error;

/// The external collaborator that resolves imported module names and
/// procedure names to callable addresses. Out of scope to reimplement (it
/// is the host's own loader and symbol table), so it is modeled as a trait
/// with a `windows-sys`-backed default and a software-only stub for tests
/// that never need to actually call into resolved code.
pub trait ModuleResolver {
    /// An opaque handle to a loaded module, returned by `load_library` and
    /// consumed by `get_proc_address`/`free_library`.
    type Handle: Clone;

    /// Loads `name` (as it appears in an import descriptor, e.g.
    /// `"KERNEL32.dll"`), returning a handle to the already-loaded module
    /// if the host process has it mapped.
    fn load_library(&self, name: &str) -> Result<Self::Handle, Error>;

    /// Resolves `name` to an address within `module`.
    fn get_proc_address(&self, module: Self::Handle, name: &str) -> Result<*const u8, Error>;

    /// Resolves ordinal `ordinal` to an address within `module`.
    fn get_proc_address_by_ordinal(&self, module: Self::Handle, ordinal: u16) -> Result<*const u8, Error>;

    /// Releases a reference to `module` acquired through `load_library`.
    fn free_library(&self, module: Self::Handle);
}

#[cfg(windows)]
pub use windows_resolver::WindowsModuleResolver;

#[cfg(windows)]
mod windows_resolver {
    use super::ModuleResolver;
    use crate::error::Error;
    use std::ffi::CString;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryA};

    /// Default [`ModuleResolver`] backed by `LoadLibraryA`/`GetProcAddress`,
    /// the same pair `MemoryDefaultLoadLibrary`/`MemoryDefaultGetProcAddress`
    /// wrap in MemoryModule.c.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsModuleResolver;

    impl ModuleResolver for WindowsModuleResolver {
        type Handle = HMODULE;

        fn load_library(&self, name: &str) -> Result<Self::Handle, Error> {
            let c_name = CString::new(name).map_err(|_| Error::ModuleNotFound)?;
            let handle = unsafe { LoadLibraryA(c_name.as_ptr() as *const u8) };
            if handle.is_null() {
                Err(Error::ModuleNotFound)
            } else {
                Ok(handle)
            }
        }

        fn get_proc_address(&self, module: Self::Handle, name: &str) -> Result<*const u8, Error> {
            let c_name = CString::new(name).map_err(|_| Error::SymbolNotFound)?;
            let addr = unsafe { GetProcAddress(module, c_name.as_ptr() as *const u8) };
            addr.map(|f| f as *const u8).ok_or(Error::SymbolNotFound)
        }

        fn get_proc_address_by_ordinal(&self, module: Self::Handle, ordinal: u16) -> Result<*const u8, Error> {
            // The low word of the "name" pointer is the ordinal when the high
            // word is zero, per `IMAGE_ORDINAL_FLAG`/`MAKEINTRESOURCEA`.
            let addr = unsafe { GetProcAddress(module, ordinal as usize as *const u8) };
            addr.map(|f| f as *const u8).ok_or(Error::SymbolNotFound)
        }

        fn free_library(&self, module: Self::Handle) {
            unsafe {
                FreeLibrary(module);
            }
        }
    }
}

/// Software-only [`ModuleResolver`] stub for tests: a fixed in-memory table
/// of module name -> (export name -> address), so the Import Binder can be
/// exercised without a real OS loader underneath it.
#[cfg(test)]
pub struct StubResolver {
    modules: std::collections::HashMap<String, std::collections::HashMap<String, usize>>,
    ordinals: std::collections::HashMap<String, std::collections::HashMap<u16, usize>>,
}

#[cfg(test)]
impl StubResolver {
    pub fn new() -> Self {
        Self {
            modules: std::collections::HashMap::new(),
            ordinals: std::collections::HashMap::new(),
        }
    }

    pub fn with_export(mut self, module: &str, name: &str, address: usize) -> Self {
        self.modules
            .entry(module.to_ascii_lowercase())
            .or_default()
            .insert(name.to_string(), address);
        self
    }

    pub fn with_ordinal(mut self, module: &str, ordinal: u16, address: usize) -> Self {
        self.ordinals
            .entry(module.to_ascii_lowercase())
            .or_default()
            .insert(ordinal, address);
        self
    }
}

#[cfg(test)]
impl ModuleResolver for StubResolver {
    type Handle = String;

    fn load_library(&self, name: &str) -> Result<Self::Handle, Error> {
        let key = name.to_ascii_lowercase();
        if self.modules.contains_key(&key) || self.ordinals.contains_key(&key) {
            Ok(key)
        } else {
            Err(Error::ModuleNotFound)
        }
    }

    fn get_proc_address(&self, module: Self::Handle, name: &str) -> Result<*const u8, Error> {
        self.modules
            .get(&module)
            .and_then(|exports| exports.get(name))
            .map(|&addr| addr as *const u8)
            .ok_or(Error::SymbolNotFound)
    }

    fn get_proc_address_by_ordinal(&self, module: Self::Handle, ordinal: u16) -> Result<*const u8, Error> {
        self.ordinals
            .get(&module)
            .and_then(|exports| exports.get(&ordinal))
            .map(|&addr| addr as *const u8)
            .ok_or(Error::SymbolNotFound)
    }

    fn free_library(&self, _module: Self::Handle) {}
}
