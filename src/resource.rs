use crate::error::{Error, ResourceError};
use crate::image::ImageView;
use crate::pe::PortableExecutable;

#[cfg(test)]
use crate::coff::CoffFileHeader;
#[cfg(test)]
use crate::optional::{DataDirectory, OptionalHeader64};

/// Resource type `RT_STRING` (6): string tables, bundled 16 strings per
/// resource as `LoadString`/`LoadStringEx` expect.
pub const RT_STRING: u16 = 6;

/// `MAKELANGID(LANG_NEUTRAL, SUBLANG_NEUTRAL)` — the language id
/// `_MemorySearchResourceEntry` falls back to first, mirroring
/// MemoryModule.c's `DEFAULT_LANGUAGE`.
pub const DEFAULT_LANGUAGE: u16 = 0;

/// A resource's type, name, or language identifier: either a numeric id or
/// a string name. `"#123"` is a string that spells a numeric id rather than
/// a literal name — `FindResource` in Win32 (and `_MemorySearchResourceEntry`
/// here) treats it as [`ResourceId::Id(123)`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    /// A numeric resource identifier.
    Id(u16),
    /// A string resource name, matched case-insensitively.
    Name(String),
}

impl ResourceId {
    /// Parses a resource identifier the way `FindResource` does: a leading
    /// `#` followed by digits names an ordinal, anything else is a literal
    /// name.
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix('#') {
            if let Ok(id) = rest.parse::<u16>() {
                return ResourceId::Id(id);
            }
        }
        ResourceId::Name(s.to_string())
    }
}

impl From<u16> for ResourceId {
    fn from(id: u16) -> Self {
        ResourceId::Id(id)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId::parse(s)
    }
}

/// The resolved location and size of a resource's raw data.
#[derive(Debug, Clone, Copy)]
pub struct ResourceData {
    /// RVA of the resource's bytes.
    pub rva: u32,
    /// Size of the resource's bytes.
    pub size: u32,
    /// Code page the resource's text (if any) is encoded in.
    pub code_page: u32,
}

/// Resource Directory Walker: descends the type -> name -> language tree
/// rooted at the resource data directory, the same structure
/// `MemoryFindResourceEx` walks via `_MemorySearchResourceEntry`.
///
/// Each level is a binary search: named entries are sorted first
/// (case-insensitive, by the decoded `IMAGE_RESOURCE_DIR_STRING_U`), id
/// entries second (sorted by numeric id). A language miss at the third
/// level does not fail the lookup — it falls back unconditionally to the
/// first id entry in that subdirectory, matching `_MemorySearchResourceEntry`'s
/// behavior when an exact or `DEFAULT_LANGUAGE` match isn't present.
pub fn find_resource(
    headers: &PortableExecutable,
    image: &ImageView,
    res_type: ResourceId,
    name: ResourceId,
    language: Option<u16>,
) -> Result<ResourceData, Error> {
    let directory = headers.data_directories().resource_table;
    if directory.size == 0 {
        return Err(ResourceError::DataNotFound.into());
    }
    let root = directory.virtual_address as usize;

    let type_dir = search_level(image, root, root, res_type)?.ok_or(ResourceError::TypeNotFound)?;
    let type_dir_offset = root + (type_dir & 0x7fff_ffff) as usize;
    let name_dir = search_level(image, root, type_dir_offset, name)?.ok_or(ResourceError::NameNotFound)?;

    let lang_dir_offset = root + (name_dir & 0x7fff_ffff) as usize;
    let data_offset = match language {
        Some(lang) => match search_level(image, root, lang_dir_offset, ResourceId::Id(lang))? {
            Some(offset) => offset,
            None => first_id_entry_data(image, lang_dir_offset)?.ok_or(ResourceError::LangNotFound)?,
        },
        None => first_id_entry_data(image, lang_dir_offset)?.ok_or(ResourceError::LangNotFound)?,
    };

    read_data_entry(image, root + data_offset as usize)
}

/// Looks up `id` within the directory at `dir_offset` and returns the raw
/// `OffsetToData` field of the matching entry (still carrying the
/// subdirectory-vs-data-entry high bit, per `IMAGE_RESOURCE_DIRECTORY_ENTRY`).
fn search_level(
    image: &ImageView,
    resource_base: usize,
    dir_offset: usize,
    id: ResourceId,
) -> Result<Option<u32>, Error> {
    let named_count = image.read_u16(dir_offset + 12)? as usize;
    let id_count = image.read_u16(dir_offset + 14)? as usize;

    match id {
        ResourceId::Name(name) => search_named(image, resource_base, dir_offset, named_count, &name),
        ResourceId::Id(value) => search_id(image, dir_offset, named_count, id_count, value),
    }
}

fn entry_offset(dir_offset: usize, index: usize) -> usize {
    dir_offset + 16 + index * 8
}

fn search_named(
    image: &ImageView,
    resource_base: usize,
    dir_offset: usize,
    named_count: usize,
    name: &str,
) -> Result<Option<u32>, Error> {
    let target = name.to_ascii_uppercase();
    let mut low: i64 = 0;
    let mut high: i64 = named_count as i64 - 1;

    while low <= high {
        let mid = (low + high) / 2;
        let offset = entry_offset(dir_offset, mid as usize);
        let name_field = image.read_u32(offset)?;
        let string_offset = resource_base + (name_field & 0x7fff_ffff) as usize;
        let candidate = read_resource_string(image, string_offset)?;

        match candidate.to_ascii_uppercase().cmp(&target) {
            core::cmp::Ordering::Equal => return Ok(Some(image.read_u32(offset + 4)?)),
            core::cmp::Ordering::Less => low = mid + 1,
            core::cmp::Ordering::Greater => high = mid - 1,
        }
    }

    Ok(None)
}

fn search_id(
    image: &ImageView,
    dir_offset: usize,
    named_count: usize,
    id_count: usize,
    id: u16,
) -> Result<Option<u32>, Error> {
    let mut low: i64 = 0;
    let mut high: i64 = id_count as i64 - 1;

    while low <= high {
        let mid = (low + high) / 2;
        let offset = entry_offset(dir_offset, named_count + mid as usize);
        let candidate = (image.read_u32(offset)? & 0xffff) as u16;

        match candidate.cmp(&id) {
            core::cmp::Ordering::Equal => return Ok(Some(image.read_u32(offset + 4)?)),
            core::cmp::Ordering::Less => low = mid + 1,
            core::cmp::Ordering::Greater => high = mid - 1,
        }
    }

    Ok(None)
}

fn first_id_entry_data(image: &ImageView, dir_offset: usize) -> Result<Option<u32>, Error> {
    let named_count = image.read_u16(dir_offset + 12)? as usize;
    let id_count = image.read_u16(dir_offset + 14)? as usize;
    if id_count == 0 {
        return Ok(None);
    }
    let offset = entry_offset(dir_offset, named_count);
    Ok(Some(image.read_u32(offset + 4)?))
}

fn read_resource_string(image: &ImageView, offset: usize) -> Result<String, Error> {
    let len = image.read_u16(offset)? as usize;
    let bytes = image.read_bytes(offset + 2, len * 2)?;
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    Ok(String::from_utf16_lossy(&units))
}

fn read_data_entry(image: &ImageView, offset: usize) -> Result<ResourceData, Error> {
    Ok(ResourceData {
        rva: image.read_u32(offset)?,
        size: image.read_u32(offset + 4)?,
        code_page: image.read_u32(offset + 8)?,
    })
}

/// `LoadString`: returns the string with identifier `id` out of the image's
/// `RT_STRING` resources. Mirrors MemoryModule.c's `MemoryLoadString`,
/// which is `MemoryLoadStringEx` with [`DEFAULT_LANGUAGE`].
pub fn load_string(headers: &PortableExecutable, image: &ImageView, id: u16) -> Result<String, Error> {
    load_string_ex(headers, image, id, DEFAULT_LANGUAGE)
}

/// `LoadStringEx`: string tables bundle 16 consecutive string resource ids
/// into one `RT_STRING` resource, numbered `(id >> 4) + 1`; within that
/// resource's data each of the 16 strings is stored back-to-back as a
/// 16-bit length prefix followed by that many UTF-16 code units (no NUL
/// terminator, and a zero-length entry for any of the 16 ids that isn't
/// actually used). This walks past `id & 0xf` of them to reach the
/// requested string.
pub fn load_string_ex(
    headers: &PortableExecutable,
    image: &ImageView,
    id: u16,
    language: u16,
) -> Result<String, Error> {
    let table_id = (id >> 4) + 1;
    let data = find_resource(
        headers,
        image,
        ResourceId::Id(RT_STRING),
        ResourceId::Id(table_id),
        Some(language),
    )?;

    let mut offset = data.rva as usize;
    let end = offset + data.size as usize;
    let skip = (id & 0xf) as usize;

    for _ in 0..skip {
        let len = image.read_u16(offset)? as usize;
        offset += 2 + len * 2;
        if offset > end {
            return Err(ResourceError::DataNotFound.into());
        }
    }

    if offset >= end {
        return Ok(String::new());
    }

    read_resource_string(image, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ordinal_shorthand() {
        assert_eq!(ResourceId::parse("#42"), ResourceId::Id(42));
        assert_eq!(ResourceId::parse("ICON_MAIN"), ResourceId::Name("ICON_MAIN".to_string()));
        assert_eq!(ResourceId::parse("#notanumber"), ResourceId::Name("#notanumber".to_string()));
    }

    fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a minimal three-level resource directory (type 6 -> id 1 ->
    /// language 0) whose data entry points at RVA `0x5000`, size 4.
    fn build_resource_fixture() -> (Vec<u8>, usize) {
        let mut bytes = vec![0u8; 8192];
        let root = 0x1000usize;

        // Type-level directory: one id entry (RT_STRING=6) -> name-level dir.
        put_u16(&mut bytes, root + 14, 1); // NumberOfIdEntries
        put_u32(&mut bytes, root + 16, RT_STRING as u32);
        let name_dir = root + 0x20;
        put_u32(&mut bytes, root + 20, 0x8000_0000 | (name_dir - root) as u32);

        // Name-level directory: one id entry (id 1) -> lang-level dir.
        put_u16(&mut bytes, name_dir + 14, 1);
        put_u32(&mut bytes, name_dir + 16, 1);
        let lang_dir = root + 0x40;
        put_u32(&mut bytes, name_dir + 20, 0x8000_0000 | (lang_dir - root) as u32);

        // Language-level directory: one id entry (language 0) -> data entry.
        put_u16(&mut bytes, lang_dir + 14, 1);
        put_u32(&mut bytes, lang_dir + 16, 0);
        let data_entry = root + 0x60;
        put_u32(&mut bytes, lang_dir + 20, (data_entry - root) as u32);

        put_u32(&mut bytes, data_entry, 0x5000);
        put_u32(&mut bytes, data_entry + 4, 4);

        (bytes, root)
    }

    #[test]
    fn walks_type_name_language_to_data_entry() {
        let (mut bytes, root) = build_resource_fixture();
        let image = unsafe { ImageView::new(bytes.as_mut_ptr(), bytes.len()) };

        let offset = search_level(&image, root, root, ResourceId::Id(RT_STRING))
            .unwrap()
            .unwrap();
        assert_eq!(offset & 0x8000_0000, 0x8000_0000);

        let name_offset = search_level(&image, root, root + (offset & 0x7fff_ffff) as usize, ResourceId::Id(1))
            .unwrap()
            .unwrap();
        assert_eq!(name_offset & 0x8000_0000, 0x8000_0000);

        let lang_dir = root + (name_offset & 0x7fff_ffff) as usize;
        let data_offset = search_level(&image, root, lang_dir, ResourceId::Id(0)).unwrap().unwrap();
        let entry = read_data_entry(&image, root + data_offset as usize).unwrap();
        assert_eq!(entry.rva, 0x5000);
        assert_eq!(entry.size, 4);
    }

    /// Regression test for the "is-subdirectory" high bit not being masked
    /// off `type_dir`/`name_dir` before they're used as offsets: every real
    /// resource directory entry above the top level has that bit set, so a
    /// fixture that only exercises `search_level` directly (as the two
    /// tests above do) would never have caught it.
    #[test]
    fn find_resource_descends_through_every_level() {
        let (mut bytes, root) = build_resource_fixture();
        bytes.resize(bytes.len().max(root + 0x100), 0);
        let image = unsafe { ImageView::new(bytes.as_mut_ptr(), bytes.len()) };

        let headers = PortableExecutable {
            coff: CoffFileHeader::default(),
            optional_header_32: None,
            optional_header_64: Some(OptionalHeader64 {
                data_directories: crate::optional::DataDirectories {
                    resource_table: DataDirectory { virtual_address: root as u32, size: 0x100 },
                    ..Default::default()
                },
                ..Default::default()
            }),
            section_table: Vec::new(),
        };

        let data = find_resource(&headers, &image, ResourceId::Id(RT_STRING), ResourceId::Id(1), Some(0))
            .unwrap();
        assert_eq!(data.rva, 0x5000);
        assert_eq!(data.size, 4);
    }

    #[test]
    fn language_miss_falls_back_to_first_id_entry() {
        let (mut bytes, root) = build_resource_fixture();
        let image = unsafe { ImageView::new(bytes.as_mut_ptr(), bytes.len()) };
        let lang_dir = root + 0x40;

        let miss = search_level(&image, root, lang_dir, ResourceId::Id(0x0409)).unwrap();
        assert!(miss.is_none());

        let fallback = first_id_entry_data(&image, lang_dir).unwrap().unwrap();
        let entry = read_data_entry(&image, root + fallback as usize).unwrap();
        assert_eq!(entry.rva, 0x5000);
    }
}
