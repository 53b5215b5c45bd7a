//! On-flash layout of pages and records and the one-way state words that drive them.
//!
//! Every multi-byte field is stored little-endian. State words start out erased (all ones) and
//! each step clears the next lowest byte, so a transition never needs to set a bit.

use crate::platform::{AlignedOps, Platform};
use alloc::vec;
use core::mem::size_of;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;

pub const PAGE_SIZE: usize = 4096;
pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const RECORD_HEADER_SIZE: usize = 12;
pub(crate) const RECORD_ALIGN: usize = 4;

/// Largest payload a single record can carry: one page minus the page and record headers.
pub const MAX_VALUE_LENGTH: usize = PAGE_SIZE - PAGE_HEADER_SIZE - RECORD_HEADER_SIZE;

pub(crate) const PAGE_MAGIC: u32 = 0x5771_4B76;
pub(crate) const LAYOUT_VERSION: u8 = 0x01;

/// Empty pages the allocator never hands out, defragmentation needs them as destination.
pub(crate) const RESERVED_EMPTY_PAGES: usize = 1;
pub(crate) const MIN_PAGE_COUNT: usize = 2;

/// Field offsets inside the headers
pub(crate) const PAGE_STATE_OFFSET: usize = 4;
pub(crate) const RECORD_LENGTH_OFFSET: usize = 4;
const STATE_WORD_SIZE: usize = 4;

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);
const _: () = assert!(size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub(crate) enum PageType {
    Normal = 0xFFFF_FFFF,
    Defrag = 0xFFFF_FF00,
}

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum PageState {
    Empty = 0xFFFF_FFFF,
    Using = 0xFFFF_FF00,
    Defragging = 0xFFFF_0000,
}

/// Lifecycle of a single record. The declaration order is the only legal direction.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum KeyState {
    Unused = 0xFFFF_FFFF,
    Writing = 0xFFFF_FF00,
    Valid = 0xFFFF_0000,
    Deleting = 0xFF00_0000,
    Invalid = 0x0000_0000,
}

/// A state word that only moves forward by clearing whole low-order bytes.
pub(crate) trait MonotonicState: Copy + Eq {
    /// Number of low-order bytes of the state word that are zero in this state
    fn cleared_bytes(self) -> usize;

    fn raw(self) -> u32;
}

impl MonotonicState for PageState {
    fn cleared_bytes(self) -> usize {
        match self {
            PageState::Empty => 0,
            PageState::Using => 1,
            PageState::Defragging => 2,
        }
    }

    fn raw(self) -> u32 {
        self as u32
    }
}

impl MonotonicState for KeyState {
    fn cleared_bytes(self) -> usize {
        match self {
            KeyState::Unused => 0,
            KeyState::Writing => 1,
            KeyState::Valid => 2,
            KeyState::Deleting => 3,
            KeyState::Invalid => 4,
        }
    }

    fn raw(self) -> u32 {
        self as u32
    }
}

/// Discriminants run the other way round, so ordering goes by cleared bytes.
pub(crate) fn can_transition<S: MonotonicState>(from: S, to: S) -> bool {
    to.cleared_bytes() > from.cleared_bytes()
}

/// Byte span inside the state word that has to be programmed to get from `from` to `to`.
pub(crate) fn physical_write_for_transition<S: MonotonicState>(
    from: S,
    to: S,
) -> Option<Range<usize>> {
    can_transition(from, to).then(|| from.cleared_bytes()..to.cleared_bytes())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct PageHeader {
    pub(crate) page_type: u32,
    pub(crate) state: u32,
    pub(crate) magic: u32,
    pub(crate) id: u16,
    pub(crate) version: u8,
    pub(crate) reserved: u8,
}

impl PageHeader {
    /// Header written right after erasing a page
    pub(crate) fn formatted(id: u16) -> Self {
        Self {
            page_type: PageType::Normal as u32,
            state: PageState::Empty as u32,
            magic: PAGE_MAGIC,
            id,
            version: LAYOUT_VERSION,
            reserved: 0xFF,
        }
    }

    /// `None` if the header never completed or got corrupted
    pub(crate) fn page_state(&self) -> Option<PageState> {
        if self.magic != PAGE_MAGIC || PageType::from_repr(self.page_type).is_none() {
            return None;
        }
        PageState::from_repr(self.state)
    }

    pub(crate) fn to_bytes(self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0xFFu8; PAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.page_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.state.to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic.to_le_bytes());
        buf[12..14].copy_from_slice(&self.id.to_le_bytes());
        buf[14] = self.version;
        buf[15] = self.reserved;
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; PAGE_HEADER_SIZE]) -> Self {
        Self {
            page_type: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            state: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            magic: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            id: u16::from_le_bytes([buf[12], buf[13]]),
            version: buf[14],
            reserved: buf[15],
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub(crate) struct RecordHeader {
    pub(crate) state: u32,
    pub(crate) length: u32,
    pub(crate) id: u16,
    pub(crate) writeable: u8,
    pub(crate) reserved: u8,
}

impl RecordHeader {
    pub(crate) fn new(state: KeyState, id: u16, length: usize, writeable: bool) -> Self {
        Self {
            state: state as u32,
            length: length as u32,
            id,
            writeable: writeable as u8,
            reserved: 0xFF,
        }
    }

    pub(crate) fn state(&self) -> Option<KeyState> {
        KeyState::from_repr(self.state)
    }

    pub(crate) fn writeable(&self) -> bool {
        self.writeable != 0
    }

    pub(crate) fn value_length(&self) -> usize {
        self.length as usize
    }

    pub(crate) fn is_erased(&self) -> bool {
        self.to_bytes().iter().all(|&b| b == 0xFF)
    }

    /// Bytes the record occupies in its page, header included. A `Writing` record whose length
    /// was never committed takes up only its header. `None` for any other oversized length.
    pub(crate) fn span(&self) -> Option<usize> {
        let length = self.value_length();
        if length <= MAX_VALUE_LENGTH {
            Some(record_span(length))
        } else if self.state() == Some(KeyState::Writing) {
            Some(RECORD_HEADER_SIZE)
        } else {
            None
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0xFFu8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.state.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..10].copy_from_slice(&self.id.to_le_bytes());
        buf[10] = self.writeable;
        buf[11] = self.reserved;
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            state: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            id: u16::from_le_bytes([buf[8], buf[9]]),
            writeable: buf[10],
            reserved: buf[11],
        }
    }
}

#[inline(always)]
pub(crate) const fn record_span(length: usize) -> usize {
    RECORD_HEADER_SIZE + crate::platform::align_ceil(length, RECORD_ALIGN)
}

pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let head = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !head.is_empty() {
            hal.write(offset, head)?;
        }

        // erased flash already reads as all ones
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        Ok(())
    }
}

/// Programs the part of the state word at `offset` that changes between `from` and `to`,
/// widened to the write granularity. Bytes outside the changed span are written with the
/// value they already hold.
pub(crate) fn write_state_transition<T: Platform, S: MonotonicState>(
    hal: &mut T,
    offset: u32,
    from: S,
    to: S,
) -> Result<(), T::Error> {
    let Some(span) = physical_write_for_transition(from, to) else {
        return Ok(());
    };

    let word = to.raw().to_le_bytes();
    let start = T::align_write_floor(span.start);
    let end = T::align_write_ceil(span.end).min(STATE_WORD_SIZE);

    #[cfg(feature = "defmt")]
    trace!("write_state_transition @{:#08x}: [{}..{}]", offset, start, end);

    hal.write(offset + start as u32, &word[start..end])
}
