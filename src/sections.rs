use crate::error::Error;
use crate::image::ImageView;
use crate::pe::PortableExecutable;

/// Section Materializer: copies each section's on-disk bytes to its
/// relative virtual address inside the committed image, or zero-fills
/// `SectionAlignment` bytes there for sections that carry no file data at
/// all (`.bss` and similar). The destination is always computed straight
/// from `VirtualAddress`, never rounded, so this works even when
/// `SectionAlignment` is smaller than the host page size.
///
/// Mirrors MemoryModule.c's `CopySections` exactly: it copies precisely
/// `SizeOfRawData` bytes and relies on the surrounding region already
/// having been committed zeroed by the Image Allocator, rather than
/// explicitly zero-filling the gap up to `VirtualSize` itself.
pub fn materialize_sections(
    source: &[u8],
    headers: &PortableExecutable,
    image: &mut ImageView,
) -> Result<(), Error> {
    let alignment = headers.section_alignment();

    for section in &headers.section_table {
        let dest_offset = section.virtual_address as usize;

        if section.size_of_raw_data == 0 {
            let section_size = alignment as usize;
            if section_size > 0 {
                image.write_bytes(dest_offset, &vec![0u8; section_size])?;
            }
            continue;
        }

        let raw_offset = section.pointer_to_raw_data as usize;
        let raw_size = section.size_of_raw_data as usize;
        let data = source
            .get(raw_offset..raw_offset + raw_size)
            .ok_or(Error::InvalidData)?;
        image.write_bytes(dest_offset, data)?;
    }

    Ok(())
}
