#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const PAGE_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 16;
pub const RECORD_HEADER_SIZE: usize = 12;
pub const PAGE_MAGIC: u32 = 0x5771_4B76;

pub const PAGE_EMPTY: u32 = 0xFFFF_FFFF;
pub const PAGE_USING: u32 = 0xFFFF_FF00;
pub const PAGE_DEFRAGGING: u32 = 0xFFFF_0000;

pub const KEY_WRITING: u32 = 0xFFFF_FF00;
pub const KEY_VALID: u32 = 0xFFFF_0000;
pub const KEY_DELETING: u32 = 0xFF00_0000;
pub const KEY_INVALID: u32 = 0x0000_0000;

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    /// Any operation, reads included, fails once this many operations have been logged
    pub fail_after_operation: usize,
    /// Writes and erases fail once this many of them have been logged
    pub fail_after_write: usize,
    /// Bytes of the failing write that still reach the flash
    pub tear: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; PAGE_SIZE * pages],
            fail_after_operation: usize::MAX,
            fail_after_write: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new(pages)
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_after_write = usize::MAX;
        self.tear = 0;
    }

    /// Lets the next `writes` writes or erases through, the one after only lands its first
    /// `tear` bytes and fails.
    pub fn fail_after_writes(&mut self, writes: usize, tear: usize) {
        self.fail_after_write = self.writes() + writes;
        self.tear = tear;
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| !matches!(op, Operation::Read { .. }))
            .count()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    /// Operations other than reads, in order
    pub fn modifications(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| !matches!(op, Operation::Read { .. }))
            .cloned()
            .collect()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    /// Erases a page and writes a header with the given raw state.
    pub fn format_page(&mut self, page: usize, state: u32) {
        let start = page * PAGE_SIZE;
        self.buf[start..start + PAGE_SIZE].fill(0xFF);

        let mut header = [0xFFu8; PAGE_HEADER_SIZE];
        header[4..8].copy_from_slice(&state.to_le_bytes());
        header[8..12].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        header[12..14].copy_from_slice(&(page as u16).to_le_bytes());
        header[14] = 0x01;
        self.buf[start..start + PAGE_HEADER_SIZE].copy_from_slice(&header);
    }

    /// Places a raw record and returns the offset behind it.
    pub fn put_record(
        &mut self,
        page: usize,
        offset: usize,
        state: u32,
        id: u16,
        data: &[u8],
        writeable: bool,
    ) -> usize {
        self.put_raw_record(page, offset, state, data.len() as u32, id, writeable);
        let start = page * PAGE_SIZE + offset + RECORD_HEADER_SIZE;
        self.buf[start..start + data.len()].copy_from_slice(data);
        offset + RECORD_HEADER_SIZE + data.len().next_multiple_of(WORD_SIZE)
    }

    pub fn put_raw_record(
        &mut self,
        page: usize,
        offset: usize,
        state: u32,
        length: u32,
        id: u16,
        writeable: bool,
    ) {
        let start = page * PAGE_SIZE + offset;
        let mut header = [0xFFu8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&state.to_le_bytes());
        header[4..8].copy_from_slice(&length.to_le_bytes());
        header[8..10].copy_from_slice(&id.to_le_bytes());
        header[10] = writeable as u8;
        self.buf[start..start + RECORD_HEADER_SIZE].copy_from_slice(&header);
    }

    pub fn record_state(&self, page: usize, offset: usize) -> u32 {
        let start = page * PAGE_SIZE + offset;
        u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap())
    }

    pub fn record_length(&self, page: usize, offset: usize) -> u32 {
        let start = page * PAGE_SIZE + offset + 4;
        u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap())
    }

    pub fn page_state(&self, page: usize) -> u32 {
        let start = page * PAGE_SIZE + 4;
        u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap())
    }

    fn fault(&self, write: bool) -> bool {
        self.operations.len() >= self.fail_after_operation
            || (write && self.writes() >= self.fail_after_write)
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        if self.fault(false) {
            println!("    flash: read:  0x{offset:04X} FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.fault(true) {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        let landed = if self.fault(true) {
            self.tear.min(bytes.len())
        } else {
            bytes.len()
        };

        let start = offset as usize;
        for (i, &val) in bytes[..landed].iter().enumerate() {
            // nor flash can only flip bits from 1 to 0
            self.buf[start + i] &= val;
        }

        if landed < bytes.len() || self.fault(true) {
            println!("    flash: FAULT after {landed} bytes");
            return Err(FlashError);
        }

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });
        Ok(())
    }
}

/// Flash with `pages` formatted pages, page 0 in use and holding `records` back to back.
pub fn flash_with_records(pages: usize, records: &[(u32, u16, &[u8], bool)]) -> Flash {
    let mut flash = Flash::new(pages);
    for page in 0..pages {
        flash.format_page(page, PAGE_EMPTY);
    }
    flash.format_page(0, PAGE_USING);

    let mut offset = PAGE_HEADER_SIZE;
    for &(state, id, data, writeable) in records {
        offset = flash.put_record(0, offset, state, id, data, writeable);
    }
    flash
}
