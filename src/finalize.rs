use crate::error::Error;
use crate::pe::PortableExecutable;
use crate::section::{SectionFlags, SectionHeader};
use crate::vm::{Protection, VirtualMemoryService};

/// A run of one or more adjacent sections that share a page and therefore
/// must be protected together. Sections sharing a page inherit the union of
/// each other's protection flags — a page can't be readable for one
/// section and inaccessible for its neighbor.
struct PageGroup {
    start: usize,
    aligned_start: usize,
    size: usize,
    characteristics: u32,
}

/// Mirrors MemoryModule.c's `GetRealSectionSize`: a section's footprint for
/// finalization purposes is `SizeOfRawData` when nonzero; otherwise the
/// image-wide `SizeOfInitializedData`/`SizeOfUninitializedData` total from
/// the optional header, picked by whichever of `CNT_INITIALIZED_DATA`/
/// `CNT_UNINITIALIZED_DATA` the section's own characteristics carry; zero
/// if neither applies. Never rounded to a page or section alignment — the
/// coalescing loop above rounds only the *address*, not this size.
fn real_section_size(headers: &PortableExecutable, section: &SectionHeader) -> u32 {
    let mut size = section.size_of_raw_data;
    if size == 0 {
        let flags = section.get_characteristics().unwrap_or_else(SectionFlags::empty);
        if flags.contains(SectionFlags::IMAGE_SCN_CNT_INITALIZED_DATA) {
            size = headers.size_of_initialized_data();
        } else if flags.contains(SectionFlags::IMAGE_SCN_CNT_UNINITALIZED_DATA) {
            size = headers.size_of_uninitialized_data();
        }
    }
    size
}

/// Section Finalizer: walks the section table in file order, coalescing
/// runs of sections that land on the same page into a single protection
/// change, and applies each group's final page protection.
///
/// Mirrors MemoryModule.c's `FinalizeSections`/`FinalizeSection`, including
/// its unexplained-but-preserved coalescing rule (a group absorbs the next
/// section whenever the next section's *aligned* start matches the
/// group's, or the group's un-aligned extent already runs into it) and its
/// characteristics merge rule: a group only keeps
/// `IMAGE_SCN_MEM_DISCARDABLE` if every section folded into it is
/// discardable, since a single non-discardable neighbor forces the whole
/// page to stay committed and protected.
///
/// A group that is fully discardable, begins on a page boundary, and
/// satisfies one of the three decommit-eligibility conditions in §4.7 is
/// decommitted via [`crate::vm::VirtualMemoryService::decommit`] instead of
/// being left committed at whatever protection the Image Allocator set.
pub fn finalize_sections<V: VirtualMemoryService>(
    headers: &PortableExecutable,
    image_base: *mut u8,
    vm: &V,
) -> Result<(), Error> {
    let page_size = vm.page_size();
    let alignment = headers.section_alignment();
    let mut sections = headers.section_table.iter();

    let Some(first) = sections.next() else {
        return Ok(());
    };

    let mut group = PageGroup {
        start: first.virtual_address as usize,
        aligned_start: align_down(first.virtual_address as usize, page_size),
        size: real_section_size(headers, first) as usize,
        characteristics: first.characteristics,
    };

    for section in sections {
        let start = section.virtual_address as usize;
        let aligned_start = align_down(start, page_size);
        let size = real_section_size(headers, section) as usize;

        if group.aligned_start == aligned_start || group.start + group.size > aligned_start {
            merge_characteristics(&mut group, section.characteristics);
            group.size = (start + size).saturating_sub(group.start);
            continue;
        }

        apply_group(&group, image_base, vm, alignment, false)?;
        group = PageGroup { start, aligned_start, size, characteristics: section.characteristics };
    }

    apply_group(&group, image_base, vm, alignment, true)
}

fn merge_characteristics(group: &mut PageGroup, other: u32) {
    let discardable = SectionFlags::IMAGE_SCN_MEM_DISCARDABLE.bits();
    if other & discardable == 0 || group.characteristics & discardable == 0 {
        group.characteristics = (group.characteristics | other) & !discardable;
    } else {
        group.characteristics |= other;
    }
}

fn apply_group<V: VirtualMemoryService>(
    group: &PageGroup,
    image_base: *mut u8,
    vm: &V,
    alignment: u32,
    is_last: bool,
) -> Result<(), Error> {
    if group.size == 0 {
        return Ok(());
    }

    let discardable = SectionFlags::IMAGE_SCN_MEM_DISCARDABLE.bits();
    if group.characteristics & discardable != 0 {
        let page_size = vm.page_size();
        let starts_on_page_boundary = group.start == group.aligned_start;
        let eligible = starts_on_page_boundary
            && (is_last || alignment as usize == page_size || group.size % page_size == 0);
        if eligible {
            let address = unsafe { image_base.add(group.start) };
            return vm.decommit(address, group.size);
        }
    }

    let protection = Protection {
        execute: group.characteristics & SectionFlags::IMAGE_SCN_MEM_EXECUTE.bits() != 0,
        read: group.characteristics & SectionFlags::IMAGE_SCN_MEM_READ.bits() != 0,
        write: group.characteristics & SectionFlags::IMAGE_SCN_MEM_WRITE.bits() != 0,
        not_cached: group.characteristics & SectionFlags::IMAGE_SCN_MEM_NOT_CACHED.bits() != 0,
    };

    let address = unsafe { image_base.add(group.start) };
    vm.protect(address, group.size, protection)?;

    if protection.execute {
        vm.flush_instruction_cache(address, group.size);
    }

    Ok(())
}

fn align_down(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        value
    } else {
        value & !(alignment - 1)
    }
}
