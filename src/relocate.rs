use crate::error::Error;
use crate::image::ImageView;
use crate::pe::PortableExecutable;
use crate::relocation::BaseRelocationType;
use num_traits::FromPrimitive;

/// Applies the base relocation table, patching every absolute address baked
/// into the image for the difference between its preferred
/// [`PortableExecutable::image_base`] and the address it actually loaded
/// at. A no-op when `delta` is zero — the common case, since the loader
/// always tries the preferred base first.
///
/// Mirrors MemoryModule.c's `PerformBaseRelocation`: only
/// [`BaseRelocationType::HighLow`] (32-bit images) and
/// [`BaseRelocationType::Dir64`] (64-bit images) entries are patched.
/// [`BaseRelocationType::Absolute`] entries are explicitly-skipped padding;
/// any other entry type is skipped too, for forward compatibility with
/// relocation encodings this crate doesn't act on.
pub fn relocate(headers: &PortableExecutable, image: &mut ImageView, delta: i64) -> Result<(), Error> {
    if delta == 0 {
        return Ok(());
    }

    let directory = headers.data_directories().base_relocation_table;
    if directory.size == 0 {
        // Relocation information was stripped; the image cannot be moved.
        return Err(Error::BadFormat);
    }

    let mut offset = directory.virtual_address as usize;
    let end = offset + directory.size as usize;

    while offset < end {
        let page_rva = image.read_u32(offset)? as usize;
        let block_size = image.read_u32(offset + 4)? as usize;
        if block_size < 8 {
            return Err(Error::InvalidData);
        }

        let entry_count = (block_size - 8) / 2;
        for i in 0..entry_count {
            let entry = image.read_u16(offset + 8 + i * 2)?;
            let entry_type = (entry >> 12) as u8;
            let page_offset = (entry & 0x0fff) as usize;
            let target = page_rva + page_offset;

            match BaseRelocationType::from_u8(entry_type) {
                Some(BaseRelocationType::Absolute) => {}
                Some(BaseRelocationType::HighLow) => {
                    let value = image.read_u32(target)?;
                    let patched = (value as i64).wrapping_add(delta) as u32;
                    image.write_u32(target, patched)?;
                }
                Some(BaseRelocationType::Dir64) => {
                    let value = image.read_u64(target)?;
                    let patched = (value as i64).wrapping_add(delta) as u64;
                    image.write_u64(target, patched)?;
                }
                _ => {}
            }
        }

        offset += block_size;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::parse_portable_executable;
    use crate::testutil::build_minimal_pe;

    fn install_one_highlow_block(built: &mut crate::testutil::BuiltPe, page_rva: u32, page_offset: u16) {
        let reloc_rva = built.section_rva + built.section_raw_size;
        built.bytes.resize(built.bytes.len() + 4096, 0);

        let entry: u16 = (3u16 << 12) | page_offset;
        let block_size: u32 = 8 + 2 + 2; // header + one entry + padding
        let dir_off = built.optional_header_offset + 112 + 5 * 8; // base_relocation_table is dir #5
        built.bytes[dir_off..dir_off + 4].copy_from_slice(&reloc_rva.to_le_bytes());
        built.bytes[dir_off + 4..dir_off + 8].copy_from_slice(&block_size.to_le_bytes());

        let block_off = reloc_rva as usize;
        built.bytes[block_off..block_off + 4].copy_from_slice(&page_rva.to_le_bytes());
        built.bytes[block_off + 4..block_off + 8].copy_from_slice(&block_size.to_le_bytes());
        built.bytes[block_off + 8..block_off + 10].copy_from_slice(&entry.to_le_bytes());
    }

    #[test]
    fn patches_highlow_entry_by_delta() {
        let mut built = build_minimal_pe();
        install_one_highlow_block(&mut built, built.section_rva, 0);
        let headers = parse_portable_executable(&built.bytes).unwrap();

        let mut backing = built.bytes.clone();
        backing.resize(backing.len().max(headers.size_of_image() as usize), 0);
        let original: u32 = 0x4000_0000;
        let target_offset = built.section_rva as usize;
        backing[target_offset..target_offset + 4].copy_from_slice(&original.to_le_bytes());

        let mut image = unsafe { ImageView::new(backing.as_mut_ptr(), backing.len()) };
        relocate(&headers, &mut image, 0x1000).unwrap();

        assert_eq!(image.read_u32(target_offset).unwrap(), original + 0x1000);
    }

    #[test]
    fn zero_delta_is_a_no_op_even_without_directory() {
        let built = build_minimal_pe();
        let headers = parse_portable_executable(&built.bytes).unwrap();
        let mut backing = built.bytes.clone();
        let mut image = unsafe { ImageView::new(backing.as_mut_ptr(), backing.len()) };
        assert!(relocate(&headers, &mut image, 0).is_ok());
    }
}
