use crate::raw::{PAGE_SIZE, RECORD_ALIGN};
use embedded_storage::nor_flash::NorFlash;

/// Any NOR flash driver can back the store, see README.md for an example.
///
/// Programming must only clear bits and erasing must set every bit of a sector, the state
/// machines of pages and records depend on it.
pub trait Platform: NorFlash {}

impl<T: NorFlash> Platform for T {}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }

    /// Records are 4-byte aligned and state words are 4 bytes wide, so reads and writes must
    /// not be coarser than that. Pages are erased as a whole.
    fn supports_layout() -> bool {
        Self::READ_SIZE.is_power_of_two()
            && Self::READ_SIZE <= RECORD_ALIGN
            && Self::WRITE_SIZE.is_power_of_two()
            && Self::WRITE_SIZE <= RECORD_ALIGN
            && Self::ERASE_SIZE > 0
            && PAGE_SIZE.is_multiple_of(Self::ERASE_SIZE)
    }
}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
pub(crate) const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}
