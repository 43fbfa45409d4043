use crate::error::Error;

/// Page protection requested for a committed region, expressed the way the
/// rest of this crate reasons about sections: independent executable,
/// readable, and writeable bits, plus whether the region should be marked
/// uncached. [`VirtualMemoryService`] implementations translate this into
/// whatever constants their platform's allocator expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    /// The region may be executed.
    pub execute: bool,
    /// The region may be read.
    pub read: bool,
    /// The region may be written.
    pub write: bool,
    /// The region should be mapped uncached (`IMAGE_SCN_MEM_NOT_CACHED`).
    pub not_cached: bool,
}

impl Protection {
    /// All access, cached. Used while sections are still being copied and
    /// relocated, before the Section Finalizer narrows each page down to
    /// its final protection.
    pub const READ_WRITE: Protection = Protection {
        execute: false,
        read: true,
        write: true,
        not_cached: false,
    };
}

/// The external collaborator that owns address space on the loader's
/// behalf: reserving, committing, protecting, and releasing the pages a
/// loaded image lives in. Out of scope to implement from scratch (it is
/// fundamentally an OS service), so it is modeled as a trait with a
/// `windows-sys`-backed default and a heap-backed stub for host-independent
/// unit tests.
pub trait VirtualMemoryService {
    /// Reserves (and optionally commits) `size` bytes, ideally at
    /// `preferred_base`. Implementations are free to ignore
    /// `preferred_base` and return memory anywhere; the loader treats it as
    /// a hint and recomputes relocations against whatever address comes
    /// back.
    fn reserve(&self, preferred_base: u64, size: usize) -> Result<*mut u8, Error>;

    /// Commits `size` bytes at `address`, which must already be reserved.
    fn commit(&self, address: *mut u8, size: usize) -> Result<(), Error>;

    /// Decommits `size` bytes at `address`, releasing their physical backing
    /// while leaving the address range reserved. Used by the Section
    /// Finalizer to drop fully-discardable page groups instead of leaving
    /// them committed at whatever protection the Image Allocator set.
    fn decommit(&self, address: *mut u8, size: usize) -> Result<(), Error>;

    /// Changes the protection of `size` bytes at `address`, returning the
    /// previous protection.
    fn protect(&self, address: *mut u8, size: usize, protection: Protection) -> Result<Protection, Error>;

    /// Releases the entire region that was reserved starting at `address`.
    fn free(&self, address: *mut u8);

    /// Flushes the instruction cache for `size` bytes at `address`. A no-op
    /// on architectures with coherent instruction/data caches.
    fn flush_instruction_cache(&self, address: *mut u8, size: usize);

    /// The host's page size, used to round section boundaries the same way
    /// `GetNativeSystemInfo` would.
    fn page_size(&self) -> usize;
}

#[cfg(windows)]
pub use windows_vm::WindowsVirtualMemory;

#[cfg(windows)]
mod windows_vm {
    use super::{Protection, VirtualMemoryService};
    use crate::error::Error;
    use core::ffi::c_void;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_NOCACHE, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    /// Default [`VirtualMemoryService`] backed directly by the Win32
    /// `VirtualAlloc`/`VirtualProtect`/`VirtualFree` family, the same calls
    /// MemoryModule.c itself uses.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsVirtualMemory;

    /// The 2x2x2 protection table from MemoryModule.c's `ProtectionFlags`,
    /// indexed `[executable][readable][writeable]`.
    const PROTECTION_FLAGS: [[[u32; 2]; 2]; 2] = [
        [
            // not executable
            [PAGE_NOACCESS, PAGE_WRITECOPY],
            [PAGE_READONLY, PAGE_READWRITE],
        ],
        [
            // executable
            [PAGE_EXECUTE, PAGE_EXECUTE_WRITECOPY],
            [PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE],
        ],
    ];

    pub(super) fn win32_protection(protection: Protection) -> PAGE_PROTECTION_FLAGS {
        let mut flags =
            PROTECTION_FLAGS[protection.execute as usize][protection.read as usize][protection.write as usize];
        if protection.not_cached {
            flags |= PAGE_NOCACHE;
        }
        flags
    }

    pub(super) fn from_win32_protection(flags: u32) -> Protection {
        let bare = flags & !PAGE_NOCACHE;
        let not_cached = flags & PAGE_NOCACHE != 0;
        for execute in 0..2 {
            for read in 0..2 {
                for write in 0..2 {
                    if PROTECTION_FLAGS[execute][read][write] == bare {
                        return Protection {
                            execute: execute == 1,
                            read: read == 1,
                            write: write == 1,
                            not_cached,
                        };
                    }
                }
            }
        }
        Protection::default()
    }

    impl VirtualMemoryService for WindowsVirtualMemory {
        fn reserve(&self, preferred_base: u64, size: usize) -> Result<*mut u8, Error> {
            let mut address = unsafe {
                VirtualAlloc(
                    preferred_base as *const c_void,
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };

            if address.is_null() && preferred_base != 0 {
                log::debug!("preferred base {preferred_base:#x} unavailable, falling back to system-chosen address");
                // Preferred base unavailable; let the system pick one and
                // let the Relocator fix up the difference.
                address = unsafe { VirtualAlloc(core::ptr::null(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
            }

            if address.is_null() {
                Err(Error::OutOfMemory)
            } else {
                Ok(address as *mut u8)
            }
        }

        fn commit(&self, address: *mut u8, size: usize) -> Result<(), Error> {
            let result = unsafe { VirtualAlloc(address as *const c_void, size, MEM_COMMIT, PAGE_READWRITE) };
            if result.is_null() {
                Err(Error::OutOfMemory)
            } else {
                Ok(())
            }
        }

        fn decommit(&self, address: *mut u8, size: usize) -> Result<(), Error> {
            let ok = unsafe { VirtualFree(address as *mut c_void, size, MEM_DECOMMIT) };
            if ok == 0 {
                Err(Error::ProtectFailed)
            } else {
                Ok(())
            }
        }

        fn protect(&self, address: *mut u8, size: usize, protection: Protection) -> Result<Protection, Error> {
            let mut previous: u32 = 0;
            let ok = unsafe {
                VirtualProtect(address as *const c_void, size, win32_protection(protection), &mut previous)
            };
            if ok == 0 {
                Err(Error::ProtectFailed)
            } else {
                Ok(from_win32_protection(previous))
            }
        }

        fn free(&self, address: *mut u8) {
            unsafe {
                VirtualFree(address as *mut c_void, 0, MEM_RELEASE);
            }
        }

        fn flush_instruction_cache(&self, address: *mut u8, size: usize) {
            use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
            use windows_sys::Win32::System::Threading::GetCurrentProcess;
            unsafe {
                FlushInstructionCache(GetCurrentProcess(), address as *const c_void, size);
            }
        }

        fn page_size(&self) -> usize {
            let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
            unsafe { GetSystemInfo(&mut info) };
            info.dwPageSize as usize
        }
    }
}

/// Heap-backed [`VirtualMemoryService`] stub used by unit tests that do not
/// need real page protection, only a correctly sized, correctly aligned
/// buffer to copy sections into. `protect` just records the requested
/// protection per allocation and always succeeds; `preferred_base` is
/// ignored since a boxed `Vec<u8>` cannot be placed at an arbitrary address.
#[cfg(test)]
pub struct HeapBackedVm {
    page_size: usize,
    decommitted: std::cell::RefCell<Vec<(usize, usize)>>,
}

#[cfg(test)]
impl Default for HeapBackedVm {
    fn default() -> Self {
        Self { page_size: 0x1000, decommitted: std::cell::RefCell::new(Vec::new()) }
    }
}

#[cfg(test)]
impl HeapBackedVm {
    /// `(address, size)` pairs passed to every `decommit` call so far, in
    /// order — lets tests confirm the Section Finalizer routed a group to
    /// decommit instead of to `protect`.
    pub fn decommitted_regions(&self) -> Vec<(usize, usize)> {
        self.decommitted.borrow().clone()
    }
}

#[cfg(test)]
impl VirtualMemoryService for HeapBackedVm {
    fn reserve(&self, _preferred_base: u64, size: usize) -> Result<*mut u8, Error> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), self.page_size)
            .map_err(|_| Error::OutOfMemory)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            Err(Error::OutOfMemory)
        } else {
            Ok(ptr)
        }
    }

    fn commit(&self, _address: *mut u8, _size: usize) -> Result<(), Error> {
        Ok(())
    }

    fn decommit(&self, address: *mut u8, size: usize) -> Result<(), Error> {
        self.decommitted.borrow_mut().push((address as usize, size));
        Ok(())
    }

    fn protect(&self, _address: *mut u8, _size: usize, _protection: Protection) -> Result<Protection, Error> {
        Ok(Protection::READ_WRITE)
    }

    fn free(&self, _address: *mut u8) {
        // Tests that use this stub intentionally leak: there is no record
        // of the original allocation's size/align to reconstruct the
        // `Layout` `dealloc` requires, and the allocations are tiny and
        // short-lived for the duration of a single test.
    }

    fn flush_instruction_cache(&self, _address: *mut u8, _size: usize) {}

    fn page_size(&self) -> usize {
        self.page_size
    }
}
