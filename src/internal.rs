use crate::KeyValue;
use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{
    KeyState, MAX_VALUE_LENGTH, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_STATE_OFFSET, PageHeader,
    PageState, RECORD_ALIGN, RECORD_HEADER_SIZE, RECORD_LENGTH_OFFSET, RESERVED_EMPTY_PAGES,
    RecordHeader, can_transition, record_span, write_aligned, write_state_transition,
};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, trace, warn};

/// Location of a record: page index plus byte offset inside that page. Only offsets that leave
/// room for a full record header behind the page header can be constructed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RecordAddress {
    page: u16,
    offset: u16,
}

impl RecordAddress {
    pub(crate) fn new(page: u16, offset: usize) -> Option<Self> {
        if offset < PAGE_HEADER_SIZE
            || offset + RECORD_HEADER_SIZE > PAGE_SIZE
            || !offset.is_multiple_of(RECORD_ALIGN)
        {
            return None;
        }
        Some(Self {
            page,
            offset: offset as u16,
        })
    }

    pub(crate) fn page(&self) -> u16 {
        self.page
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset as usize
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Record {
    pub(crate) address: RecordAddress,
    pub(crate) header: RecordHeader,
}

impl Record {
    pub(crate) fn id(&self) -> u16 {
        self.header.id
    }

    pub(crate) fn state(&self) -> Option<KeyState> {
        self.header.state()
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CursorState {
    Running,
    Exhausted,
    Corrupt,
}

/// Walks the records of one page in storage order. The cursor does not borrow the store, so a
/// caller can change record states between two steps.
pub(crate) struct RecordCursor {
    page: u16,
    offset: usize,
    state: CursorState,
}

impl RecordCursor {
    pub(crate) fn new(page: u16) -> Self {
        Self {
            page,
            offset: PAGE_HEADER_SIZE,
            state: CursorState::Running,
        }
    }

    pub(crate) fn next<T: Platform>(
        &mut self,
        kv: &mut KeyValue<T>,
    ) -> Result<Option<Record>, Error> {
        if self.state != CursorState::Running {
            return Ok(None);
        }

        let Some(address) = RecordAddress::new(self.page, self.offset) else {
            self.state = CursorState::Exhausted;
            return Ok(None);
        };

        let header = kv.read_record_header(address)?;
        match header.state() {
            Some(KeyState::Unused) if header.is_erased() => {
                self.state = CursorState::Exhausted;
                Ok(None)
            }
            Some(KeyState::Unused) | None => {
                #[cfg(feature = "defmt")]
                warn!("record cursor: garbage header @{}", address);

                #[cfg(feature = "debug-logs")]
                println!("  cursor: garbage header {address:?}: {header:?}");

                self.state = CursorState::Corrupt;
                Ok(None)
            }
            Some(_) => match header.span() {
                Some(span) if self.offset + span <= PAGE_SIZE => {
                    self.offset += span;
                    Ok(Some(Record { address, header }))
                }
                _ => {
                    #[cfg(feature = "defmt")]
                    warn!("record cursor: bad length {} @{}", header.length, address);

                    #[cfg(feature = "debug-logs")]
                    println!("  cursor: bad length {address:?}: {header:?}");

                    self.state = CursorState::Corrupt;
                    Ok(None)
                }
            },
        }
    }

    /// First byte behind the last readable record. Nothing may be written behind a corrupt
    /// header, so a corrupt page reports itself as full.
    pub(crate) fn end_offset(&self) -> usize {
        match self.state {
            CursorState::Corrupt => PAGE_SIZE,
            _ => self.offset,
        }
    }
}

#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ThinPageState {
    Empty,
    Using,
    Defragging,
    /// Header did not decode, recovery formats these
    Corrupt,
}

impl From<PageState> for ThinPageState {
    fn from(value: PageState) -> Self {
        match value {
            PageState::Empty => ThinPageState::Empty,
            PageState::Using => ThinPageState::Using,
            PageState::Defragging => ThinPageState::Defragging,
        }
    }
}

/// In-memory view of a page: its state and where the next record goes.
#[derive(Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct ThinPage {
    pub(crate) index: u16,
    pub(crate) state: ThinPageState,
    pub(crate) free_offset: usize,
}

impl ThinPage {
    pub(crate) fn new(index: u16) -> Self {
        Self {
            index,
            state: ThinPageState::Corrupt,
            free_offset: PAGE_SIZE,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        PAGE_SIZE - self.free_offset
    }

    fn next_free(&self, span: usize) -> Option<RecordAddress> {
        if self.remaining() < span {
            return None;
        }
        RecordAddress::new(self.index, self.free_offset)
    }
}

impl<T: Platform> KeyValue<T> {
    pub(crate) fn page_count(&self) -> u16 {
        self.pages.len() as u16
    }

    pub(crate) fn page_state(&self, page: u16) -> ThinPageState {
        self.pages[page as usize].state
    }

    fn flash_offset(&self, page: u16, offset: usize) -> u32 {
        (self.base_address + page as usize * PAGE_SIZE + offset) as u32
    }

    fn record_offset(&self, address: RecordAddress, field: usize) -> u32 {
        self.flash_offset(address.page(), address.offset() + field)
    }

    pub(crate) fn read_page_header(&mut self, page: u16) -> Result<PageHeader, Error> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let offset = self.flash_offset(page, 0);
        self.hal
            .read(offset, &mut buf)
            .map_err(|_| Error::ReadError)?;
        Ok(PageHeader::from_bytes(&buf))
    }

    pub(crate) fn read_record_header(
        &mut self,
        address: RecordAddress,
    ) -> Result<RecordHeader, Error> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let offset = self.record_offset(address, 0);
        self.hal
            .read(offset, &mut buf)
            .map_err(|_| Error::ReadError)?;
        Ok(RecordHeader::from_bytes(&buf))
    }

    pub(crate) fn read_payload(&mut self, record: &Record) -> Result<Vec<u8>, Error> {
        let length = record.header.value_length();
        if length > MAX_VALUE_LENGTH {
            return Err(Error::CorruptedData);
        }

        let mut buf = vec![0xFFu8; T::align_read(length)];
        if !buf.is_empty() {
            let offset = self.record_offset(record.address, RECORD_HEADER_SIZE);
            self.hal
                .read(offset, &mut buf)
                .map_err(|_| Error::ReadError)?;
        }
        buf.truncate(length);
        Ok(buf)
    }

    /// Reads every page header and rebuilds the page table.
    pub(crate) fn load_pages(&mut self) -> Result<(), Error> {
        for page in 0..self.page_count() {
            let header = self.read_page_header(page)?;
            let state = match header.page_state() {
                Some(state) => ThinPageState::from(state),
                None => ThinPageState::Corrupt,
            };

            let free_offset = match state {
                ThinPageState::Corrupt => PAGE_SIZE,
                _ => {
                    let mut cursor = RecordCursor::new(page);
                    while cursor.next(self)?.is_some() {}
                    cursor.end_offset()
                }
            };

            #[cfg(feature = "defmt")]
            trace!("load_pages: page {} {} free @{}", page, state, free_offset);

            #[cfg(feature = "debug-logs")]
            println!("  internal: load_pages: page {page} {state} free @{free_offset}");

            let thin = &mut self.pages[page as usize];
            thin.state = state;
            thin.free_offset = free_offset;
        }
        Ok(())
    }

    /// Erases the page and writes a fresh header.
    pub(crate) fn format_page(&mut self, page: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("format_page: {}", page);

        #[cfg(feature = "debug-logs")]
        println!("  internal: format_page: {page}");

        // until the header is back the page must not be used
        self.pages[page as usize].state = ThinPageState::Corrupt;
        self.pages[page as usize].free_offset = PAGE_SIZE;

        let offset = self.flash_offset(page, 0);
        self.hal
            .erase(offset, offset + PAGE_SIZE as u32)
            .map_err(|_| Error::FlashError)?;

        let header = PageHeader::formatted(page);
        write_aligned(&mut self.hal, offset, &header.to_bytes()).map_err(|_| Error::WriteError)?;

        self.pages[page as usize].state = ThinPageState::Empty;
        self.pages[page as usize].free_offset = PAGE_HEADER_SIZE;
        Ok(())
    }

    pub(crate) fn set_page_state(&mut self, page: u16, target: PageState) -> Result<(), Error> {
        let current = match self.page_state(page) {
            ThinPageState::Empty => PageState::Empty,
            ThinPageState::Using => PageState::Using,
            ThinPageState::Defragging => PageState::Defragging,
            ThinPageState::Corrupt => return Err(Error::PageStateError),
        };

        if current == target {
            return Ok(());
        }
        if !can_transition(current, target) {
            #[cfg(feature = "defmt")]
            error!("set_page_state: page {} {} -> {}", page, current, target);
            return Err(Error::PageStateError);
        }

        #[cfg(feature = "defmt")]
        trace!("set_page_state: page {} {} -> {}", page, current, target);

        let offset = self.flash_offset(page, PAGE_STATE_OFFSET);
        write_state_transition(&mut self.hal, offset, current, target)
            .map_err(|_| Error::WriteError)?;

        self.pages[page as usize].state = target.into();
        Ok(())
    }

    /// Moves a record forward in its lifecycle. The current state is read back from flash.
    pub(crate) fn set_key_state(
        &mut self,
        address: RecordAddress,
        target: KeyState,
    ) -> Result<(), Error> {
        let header = self.read_record_header(address)?;
        let current = header.state().ok_or(Error::KeyStateError)?;

        if current == target {
            return Ok(());
        }
        if !can_transition(current, target) {
            #[cfg(feature = "defmt")]
            error!("set_key_state: @{} {} -> {}", address, current, target);
            return Err(Error::KeyStateError);
        }

        #[cfg(feature = "defmt")]
        trace!("set_key_state: @{} {} -> {}", address, current, target);

        #[cfg(feature = "debug-logs")]
        println!(
            "  internal: set_key_state: {address:?} id {} {current} -> {target}",
            header.id
        );

        let offset = self.record_offset(address, 0);
        write_state_transition(&mut self.hal, offset, current, target)
            .map_err(|_| Error::WriteError)
    }

    /// Writes a complete record into a free slot: header as `Writing`, payload, then `Valid`.
    pub(crate) fn write_record(
        &mut self,
        address: RecordAddress,
        id: u16,
        data: &[u8],
        writeable: bool,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_record: @{} id {} [{}]", address, id, data.len());

        #[cfg(feature = "debug-logs")]
        println!(
            "  internal: write_record: {address:?} id {id} len {}",
            data.len()
        );

        let page = address.page();
        self.set_page_state(page, PageState::Using)?;

        // claim the slot before touching flash, a torn header must never be reused
        let end = address.offset() + record_span(data.len());
        let thin = &mut self.pages[page as usize];
        thin.free_offset = thin.free_offset.max(end);

        let header = RecordHeader::new(KeyState::Writing, id, data.len(), writeable);
        let offset = self.record_offset(address, 0);
        write_aligned(&mut self.hal, offset, &header.to_bytes()).map_err(|_| Error::WriteError)?;

        if !data.is_empty() {
            let offset = self.record_offset(address, RECORD_HEADER_SIZE);
            write_aligned(&mut self.hal, offset, data).map_err(|_| Error::WriteError)?;
        }

        self.set_key_state(address, KeyState::Valid)
    }

    /// Programs the payload of a `Writing` record that already carries the right header and
    /// seals it.
    pub(crate) fn complete_record(&mut self, record: &Record, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("complete_record: @{} id {}", record.address, record.id());

        if !data.is_empty() {
            let offset = self.record_offset(record.address, RECORD_HEADER_SIZE);
            write_aligned(&mut self.hal, offset, data).map_err(|_| Error::WriteError)?;
        }
        self.set_key_state(record.address, KeyState::Valid)
    }

    /// Overwrites the length field with zero, used for `Writing` records whose header write got
    /// interrupted.
    pub(crate) fn clear_record_length(&mut self, address: RecordAddress) -> Result<(), Error> {
        let offset = self.record_offset(address, RECORD_LENGTH_OFFSET);
        write_aligned(&mut self.hal, offset, &0u32.to_le_bytes()).map_err(|_| Error::WriteError)
    }

    /// Copies a record to `destination`. The source passes through `Deleting` so that a power
    /// loss leaves either copy recoverable.
    pub(crate) fn move_record(
        &mut self,
        destination: RecordAddress,
        record: &Record,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("move_record: {} -> {}", record.address, destination);

        let data = self.read_payload(record)?;
        self.set_key_state(record.address, KeyState::Deleting)?;
        self.write_record(destination, record.id(), &data, record.header.writeable())?;
        self.set_key_state(record.address, KeyState::Invalid)
    }

    /// First record with the given id and state on any page holding records.
    pub(crate) fn find_record(&mut self, id: u16, state: KeyState) -> Result<Option<Record>, Error> {
        for page in 0..self.page_count() {
            if !matches!(
                self.page_state(page),
                ThinPageState::Using | ThinPageState::Defragging
            ) {
                continue;
            }

            let mut cursor = RecordCursor::new(page);
            while let Some(record) = cursor.next(self)? {
                if record.id() == id && record.state() == Some(state) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Finds room for a record of `length` payload bytes. Pages in use are tried first, an empty
    /// page is only handed out while more than the reserved number of empty pages exist.
    pub(crate) fn alloc(&self, length: usize) -> Result<RecordAddress, Error> {
        if length > MAX_VALUE_LENGTH {
            return Err(Error::TooLong);
        }
        let span = record_span(length);

        if let Some(address) = self
            .pages
            .iter()
            .filter(|page| page.state == ThinPageState::Using)
            .find_map(|page| page.next_free(span))
        {
            return Ok(address);
        }

        let empty = self
            .pages
            .iter()
            .filter(|page| page.state == ThinPageState::Empty)
            .count();
        if empty <= RESERVED_EMPTY_PAGES {
            return Err(Error::NoEnoughSpace);
        }

        self.pages
            .iter()
            .filter(|page| page.state == ThinPageState::Empty)
            .find_map(|page| page.next_free(span))
            .ok_or(Error::NoEnoughSpace)
    }

    /// Like `alloc`, but runs one defragmentation and retries when the partition is full.
    pub(crate) fn try_alloc(&mut self, length: usize) -> Result<RecordAddress, Error> {
        match self.alloc(length) {
            Err(Error::NoEnoughSpace) => {
                #[cfg(feature = "defmt")]
                trace!("try_alloc: no room for {} bytes, defragmenting", length);

                self.defragment()?;
                self.alloc(length)
            }
            other => other,
        }
    }

    /// Used while finishing an interrupted defragmentation: any page in use or empty will do,
    /// the reserved page included.
    pub(crate) fn alloc_anywhere(&self, length: usize) -> Result<RecordAddress, Error> {
        if length > MAX_VALUE_LENGTH {
            return Err(Error::TooLong);
        }
        let span = record_span(length);

        let using = self
            .pages
            .iter()
            .filter(|page| page.state == ThinPageState::Using);
        let empty = self
            .pages
            .iter()
            .filter(|page| page.state == ThinPageState::Empty);

        using
            .chain(empty)
            .find_map(|page| page.next_free(span))
            .ok_or(Error::NoEnoughSpace)
    }

    pub(crate) fn read_key(&mut self, id: u16) -> Result<(Vec<u8>, bool), Error> {
        let record = self
            .find_record(id, KeyState::Valid)?
            .ok_or(Error::KeyNotFound)?;
        let data = self.read_payload(&record)?;
        Ok((data, record.header.writeable()))
    }

    /// Whether storing `data` under `id` changes anything. Fails for read-only records.
    pub(crate) fn needs_update(&mut self, id: u16, data: &[u8]) -> Result<bool, Error> {
        let Some(record) = self.find_record(id, KeyState::Valid)? else {
            return Ok(true);
        };

        if record.header.value_length() == data.len() && self.read_payload(&record)? == data {
            return Ok(false);
        }

        if !record.header.writeable() {
            #[cfg(feature = "defmt")]
            error!("id {} is read-only", id);
            return Err(Error::PermissionDenied);
        }
        Ok(true)
    }

    /// Stores a value without checking permissions. Empty data removes the key.
    pub(crate) fn write_key(&mut self, id: u16, data: &[u8], writeable: bool) -> Result<(), Error> {
        if data.is_empty() {
            return self.remove_key(id);
        }

        // allocation may defragment and move records around, so look up the old record after
        let address = self.try_alloc(data.len())?;

        let old = self.find_record(id, KeyState::Valid)?;
        if let Some(old) = &old {
            if old.header.value_length() == data.len() && self.read_payload(old)? == data {
                return Ok(());
            }
            self.set_key_state(old.address, KeyState::Deleting)?;
        }

        self.write_record(address, id, data, writeable)?;

        if let Some(old) = old {
            self.set_key_state(old.address, KeyState::Invalid)?;
        }
        Ok(())
    }

    pub(crate) fn remove_key(&mut self, id: u16) -> Result<(), Error> {
        let record = self
            .find_record(id, KeyState::Valid)?
            .ok_or(Error::KeyNotFound)?;

        if !record.header.writeable() {
            #[cfg(feature = "defmt")]
            error!("id {} is read-only", id);
            return Err(Error::PermissionDenied);
        }

        // no successor to wait for
        self.set_key_state(record.address, KeyState::Invalid)
    }
}
