#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

#[cfg(feature = "cache")]
pub mod cache;
mod defrag;
pub mod error;
mod get;
mod internal;
pub mod platform;
mod raw;
mod recovery;
mod set;

pub use get::Get;
pub use raw::{KeyState, MAX_VALUE_LENGTH, PAGE_SIZE, PageState};
pub use set::Set;

extern crate alloc;

use crate::error::Error;
use crate::internal::{RecordCursor, ThinPage, ThinPageState};
use crate::platform::{AlignedOps, Platform};
use crate::raw::MIN_PAGE_COUNT;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub struct KvStatistics {
    pub pages: PageStatistics,
    pub records_per_page: Vec<RecordStatistics>,
    pub records_overall: RecordStatistics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageStatistics {
    pub empty: u16,
    pub using: u16,
    pub defragging: u16,
    pub corrupted: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordStatistics {
    pub writing: u32,
    pub valid: u32,
    pub deleting: u32,
    pub invalid: u32,
    /// Bytes behind the last record that can still be allocated
    pub free_bytes: u32,
}

/// One record as listed by [`KeyValue::dump_all_keys`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordInfo {
    pub page: u16,
    pub offset: u16,
    pub id: u16,
    pub length: u32,
    pub state: KeyState,
    pub writeable: bool,
}

/// The store keeps a small table with the state and fill level of every page in memory.
/// Everything else is read from flash on demand.
pub struct KeyValue<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: usize,
    pub(crate) faulted: bool,
    pub(crate) pages: Vec<ThinPage>,
}

impl<T: Platform> KeyValue<T> {
    /// Takes over `partition_size` bytes of flash starting at `partition_offset` and runs
    /// recovery:
    /// 1. Pages without a valid header are formatted, a blank flash gets fully formatted here
    /// 2. Defragmentation that got interrupted by a power loss is finished
    /// 3. Half written and half deleted records are rolled forward or back
    pub fn new(partition_offset: usize, partition_size: usize, hal: T) -> Result<KeyValue<T>, Error> {
        if !T::supports_layout() {
            return Err(Error::UnsupportedFlash);
        }

        if !partition_offset.is_multiple_of(PAGE_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if !partition_size.is_multiple_of(PAGE_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }

        let page_count = partition_size / PAGE_SIZE;
        if page_count > u16::MAX as usize {
            return Err(Error::InvalidPartitionSize);
        }
        if page_count < MIN_PAGE_COUNT {
            return Err(Error::TooFewPages);
        }

        let pages = (0..page_count)
            .map(|index| ThinPage::new(index as u16))
            .collect();

        let mut kv = Self {
            hal,
            base_address: partition_offset,
            faulted: true,
            pages,
        };

        kv.init()?;
        Ok(kv)
    }

    /// Reloads the page table and runs recovery. Required after a flash error before the store
    /// accepts requests again.
    pub fn init(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        info!(
            "init: {} pages @{:#08x}",
            self.page_count(),
            self.base_address
        );

        self.faulted = true;
        let result = self.load_pages().and_then(|()| self.recover());

        match result {
            Ok(()) => {
                self.faulted = false;
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "defmt")]
                error!("init failed: {}", e);
                Err(e)
            }
        }
    }

    /// Formats every page, dropping all keys. Meant for a factory reset.
    pub fn force_reset(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        info!("force_reset");

        self.faulted = true;
        for page in 0..self.page_count() {
            self.format_page(page)?;
        }
        self.init()
    }

    /// Returns the value stored for `id`.
    pub fn get_key(&mut self, id: u16) -> Result<Vec<u8>, Error> {
        self.guarded(|kv| kv.read_key(id).map(|(data, _)| data))
    }

    /// Stores `data` under `id`. Storing an identical value does not touch the flash, empty
    /// data deletes the key. Read-only records (`writeable == false`) can't be changed
    /// afterwards.
    pub fn set_key(&mut self, id: u16, data: &[u8], writeable: bool) -> Result<(), Error> {
        self.guarded(|kv| {
            if data.len() > MAX_VALUE_LENGTH {
                return Err(Error::TooLong);
            }
            if !kv.needs_update(id, data)? {
                return Ok(());
            }
            kv.write_key(id, data, writeable)
        })
    }

    /// Deletes the key, fails with `KeyNotFound` if there is nothing to delete.
    pub fn del_key(&mut self, id: u16) -> Result<(), Error> {
        self.guarded(|kv| kv.remove_key(id))
    }

    /// Compacts all pages in use. Happens on its own when the partition runs full.
    pub fn defrag(&mut self) -> Result<(), Error> {
        self.guarded(|kv| kv.defragment())
    }

    /// Lists every page and every record on it, logging them along the way.
    pub fn dump_all_keys(&mut self) -> Result<Vec<RecordInfo>, Error> {
        self.guarded(|kv| {
            let mut records = Vec::new();
            for page in 0..kv.page_count() {
                let state = kv.page_state(page);

                #[cfg(feature = "defmt")]
                {
                    let header = kv.read_page_header(page)?;
                    info!(
                        "page {}: {} id {} version {}",
                        page, state, header.id, header.version
                    );
                }

                if matches!(state, ThinPageState::Empty | ThinPageState::Corrupt) {
                    continue;
                }

                let mut cursor = RecordCursor::new(page);
                while let Some(record) = cursor.next(kv)? {
                    let Some(state) = record.state() else {
                        continue;
                    };
                    let entry = RecordInfo {
                        page,
                        offset: record.address.offset() as u16,
                        id: record.id(),
                        length: record.header.length,
                        state,
                        writeable: record.header.writeable(),
                    };

                    #[cfg(feature = "defmt")]
                    info!("  {}", entry);

                    records.push(entry);
                }
            }
            Ok(records)
        })
    }

    /// Returns detailed statistics about the partition usage
    pub fn statistics(&mut self) -> Result<KvStatistics, Error> {
        self.guarded(|kv| {
            let mut pages = PageStatistics {
                empty: 0,
                using: 0,
                defragging: 0,
                corrupted: 0,
            };

            let mut records_per_page = Vec::with_capacity(kv.pages.len());
            for page in 0..kv.page_count() {
                let mut stats = RecordStatistics {
                    writing: 0,
                    valid: 0,
                    deleting: 0,
                    invalid: 0,
                    free_bytes: kv.pages[page as usize].remaining() as u32,
                };

                match kv.page_state(page) {
                    ThinPageState::Empty => pages.empty += 1,
                    ThinPageState::Using => pages.using += 1,
                    ThinPageState::Defragging => pages.defragging += 1,
                    ThinPageState::Corrupt => pages.corrupted += 1,
                }

                if kv.page_state(page) != ThinPageState::Corrupt {
                    let mut cursor = RecordCursor::new(page);
                    while let Some(record) = cursor.next(kv)? {
                        match record.state() {
                            Some(KeyState::Writing) => stats.writing += 1,
                            Some(KeyState::Valid) => stats.valid += 1,
                            Some(KeyState::Deleting) => stats.deleting += 1,
                            Some(KeyState::Invalid) => stats.invalid += 1,
                            _ => {}
                        }
                    }
                }
                records_per_page.push(stats);
            }

            let records_overall = records_per_page.iter().fold(
                RecordStatistics {
                    writing: 0,
                    valid: 0,
                    deleting: 0,
                    invalid: 0,
                    free_bytes: 0,
                },
                |acc, x| RecordStatistics {
                    writing: acc.writing + x.writing,
                    valid: acc.valid + x.valid,
                    deleting: acc.deleting + x.deleting,
                    invalid: acc.invalid + x.invalid,
                    free_bytes: acc.free_bytes + x.free_bytes,
                },
            );

            Ok(KvStatistics {
                pages,
                records_per_page,
                records_overall,
            })
        })
    }

    /// Value and writeable flag of the valid record for `id`
    pub(crate) fn load_key(&mut self, id: u16) -> Result<(Vec<u8>, bool), Error> {
        self.guarded(|kv| kv.read_key(id))
    }

    pub(crate) fn check_update(&mut self, id: u16, data: &[u8]) -> Result<bool, Error> {
        self.guarded(|kv| kv.needs_update(id, data))
    }

    /// Stores without the permission check, for values the cache already vetted
    pub(crate) fn commit_key(&mut self, id: u16, data: &[u8], writeable: bool) -> Result<(), Error> {
        self.guarded(|kv| kv.write_key(id, data, writeable))
    }

    /// Runs `op` unless a flash error happened before, and latches flash errors.
    fn guarded<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R, Error>) -> Result<R, Error> {
        if self.faulted {
            return Err(Error::NotInit);
        }

        match op(self) {
            Ok(value) => Ok(value),
            Err(Error::KeyNotFound) => Err(Error::KeyNotFound),
            Err(e) => {
                #[cfg(feature = "defmt")]
                error!("operation failed: {}", e);

                if e.is_physical() {
                    self.faulted = true;
                }
                Err(e)
            }
        }
    }
}
