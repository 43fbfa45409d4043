use crate::error::Error;
use crate::image::ImageView;
use crate::pe::PortableExecutable;
use core::ffi::c_void;

type TlsCallback = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);

/// Reads the TLS directory's callback array and returns each callback's
/// RVA, without calling any of them. Split out from [`invoke_tls_callbacks`]
/// so the directory-walking logic can be unit tested without executing
/// arbitrary code.
///
/// The TLS directory's pointer fields (`AddressOfCallBacks` and the array
/// it points to) hold absolute virtual addresses, not RVAs — they are
/// ordinary data subject to base relocation, already patched to the
/// image's actual load address by the time this runs.
pub fn tls_callback_rvas(
    headers: &PortableExecutable,
    image: &ImageView,
    image_base: u64,
) -> Result<Vec<usize>, Error> {
    let directory = headers.data_directories().tls_table;
    if directory.size == 0 {
        return Ok(Vec::new());
    }

    let is_64_bit = headers.optional_header_64.is_some();
    let dir_offset = directory.virtual_address as usize;
    let callbacks_field_offset = if is_64_bit { 24 } else { 12 };

    let callbacks_va = if is_64_bit {
        image.read_u64(dir_offset + callbacks_field_offset)?
    } else {
        image.read_u32(dir_offset + callbacks_field_offset)? as u64
    };

    if callbacks_va == 0 {
        return Ok(Vec::new());
    }

    let callbacks_rva = callbacks_va.checked_sub(image_base).ok_or(Error::InvalidData)? as usize;
    let entry_size = if is_64_bit { 8 } else { 4 };

    let mut rvas = Vec::new();
    let mut i = 0usize;
    loop {
        let entry_offset = callbacks_rva + i * entry_size;
        let callback_va = if is_64_bit {
            image.read_u64(entry_offset)?
        } else {
            image.read_u32(entry_offset)? as u64
        };

        if callback_va == 0 {
            break;
        }

        rvas.push(callback_va.checked_sub(image_base).ok_or(Error::InvalidData)? as usize);
        i += 1;
    }

    Ok(rvas)
}

/// TLS Invoker: calls every TLS callback in file order with `reason`, the
/// same notification `DllMain` receives. A no-op when the image has no TLS
/// directory or an empty callback array.
///
/// # Safety
/// Every callback address must point to valid, already-relocated,
/// already-protected executable code for the image's calling convention.
pub unsafe fn invoke_tls_callbacks(
    headers: &PortableExecutable,
    image: &ImageView,
    image_base: u64,
    reason: u32,
) -> Result<(), Error> {
    for rva in tls_callback_rvas(headers, image, image_base)? {
        let ptr = image.ptr_at(rva)?;
        let callback: TlsCallback = core::mem::transmute(ptr);
        callback(image_base as *mut c_void, reason, core::ptr::null_mut());
    }
    Ok(())
}
