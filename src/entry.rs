use crate::error::Error;
use crate::image::ImageView;
use crate::module::{DllEntryFn, EntryPoint, ExeEntryFn};
use core::ffi::c_void;

/// `DLL_PROCESS_ATTACH`, the reason code dispatched the first time an
/// image's entry point runs.
pub const DLL_PROCESS_ATTACH: u32 = 1;
/// `DLL_PROCESS_DETACH`, dispatched once during unload.
pub const DLL_PROCESS_DETACH: u32 = 0;

/// Entry-Point Dispatcher: resolves an image's entry point, if it has one,
/// into a typed function pointer ready to call.
///
/// An `AddressOfEntryPoint` of zero is valid (common for DLLs that only
/// export data or forwarders) and resolves to [`EntryPoint::None`] rather
/// than an error.
pub fn resolve_entry_point(image: &ImageView, entry_rva: u32, is_dll: bool) -> Result<EntryPoint, Error> {
    if entry_rva == 0 {
        return Ok(EntryPoint::None);
    }

    let ptr = image.ptr_at(entry_rva as usize)?;
    if is_dll {
        Ok(EntryPoint::Dll(unsafe { core::mem::transmute::<*mut u8, DllEntryFn>(ptr) }))
    } else {
        Ok(EntryPoint::Exe(unsafe { core::mem::transmute::<*mut u8, ExeEntryFn>(ptr) }))
    }
}

/// Calls a resolved [`EntryPoint`] with `reason`.
///
/// Mirrors MemoryModule.c's `MemoryCallEntryPoint`: an EXE entry point
/// takes no arguments and its return value becomes the process's would-be
/// exit code; a DLL entry point returning `FALSE` (`0`) on
/// [`DLL_PROCESS_ATTACH`] is reported as [`Error::DllInitFailed`], since
/// the OS loader would treat that the same way.
///
/// # Safety
/// The function pointer inside `entry` must point at valid, already
/// relocated, already protected executable code using the image's calling
/// convention.
pub unsafe fn call_entry(entry: &EntryPoint, image_base: *mut u8, reason: u32) -> Result<i32, Error> {
    match entry {
        EntryPoint::None => Ok(0),
        EntryPoint::Exe(f) => Ok(f()),
        EntryPoint::Dll(f) => {
            let result = f(image_base as *mut c_void, reason, core::ptr::null_mut());
            if reason == DLL_PROCESS_ATTACH && result == 0 {
                Err(Error::DllInitFailed)
            } else {
                Ok(result)
            }
        }
    }
}
