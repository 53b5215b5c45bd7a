//! Boot-time repair of everything a power loss can leave behind.
//!
//! 1. Pages whose header does not decode are formatted.
//! 2. Pages caught in the middle of defragmentation are emptied and formatted.
//! 3. Records still `Writing` or `Deleting` on pages in use are resolved one at a time.
//!
//! Every step only moves records forward, so an interrupted recovery is finished by the next
//! one and a recovery without anything to do does not touch the flash.

use crate::KeyValue;
use crate::error::Error;
use crate::internal::{Record, RecordCursor, ThinPageState};
use crate::platform::Platform;
use crate::raw::{KeyState, MAX_VALUE_LENGTH};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Platform> KeyValue<T> {
    pub(crate) fn recover(&mut self) -> Result<(), Error> {
        self.format_corrupt_pages()?;
        self.finish_defragging_pages()?;
        self.resolve_pending_records()
    }

    fn format_corrupt_pages(&mut self) -> Result<(), Error> {
        for page in 0..self.page_count() {
            if self.page_state(page) != ThinPageState::Corrupt {
                continue;
            }

            #[cfg(feature = "defmt")]
            warn!("recovery: page {} has no valid header, formatting", page);

            #[cfg(feature = "debug-logs")]
            println!("  recovery: formatting corrupt page {page}");

            self.format_page(page)?;
        }
        Ok(())
    }

    fn finish_defragging_pages(&mut self) -> Result<(), Error> {
        for page in 0..self.page_count() {
            if self.page_state(page) != ThinPageState::Defragging {
                continue;
            }

            #[cfg(feature = "defmt")]
            warn!("recovery: finishing defragmentation of page {}", page);

            #[cfg(feature = "debug-logs")]
            println!("  recovery: finishing defragmentation of page {page}");

            let mut cursor = RecordCursor::new(page);
            while let Some(record) = cursor.next(self)? {
                match record.state() {
                    Some(KeyState::Valid) => {
                        let destination = self.alloc_anywhere(record.header.value_length())?;
                        self.move_record(destination, &record)?;
                    }
                    Some(KeyState::Deleting) => self.recover_deleting_record(&record, false)?,
                    _ => {}
                }
            }

            self.format_page(page)?;
        }
        Ok(())
    }

    fn resolve_pending_records(&mut self) -> Result<(), Error> {
        // re-submitting a record can defragment and relocate everything, so search from scratch
        // after every repair
        while let Some(record) = self.find_pending_record()? {
            match record.state() {
                Some(KeyState::Writing) => self.discard_writing_record(&record)?,
                Some(KeyState::Deleting) => self.recover_deleting_record(&record, true)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn find_pending_record(&mut self) -> Result<Option<Record>, Error> {
        for page in 0..self.page_count() {
            if self.page_state(page) != ThinPageState::Using {
                continue;
            }

            let mut cursor = RecordCursor::new(page);
            while let Some(record) = cursor.next(self)? {
                if matches!(
                    record.state(),
                    Some(KeyState::Writing | KeyState::Deleting)
                ) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// A record that never reached `Valid` was never observed by anyone, drop it.
    fn discard_writing_record(&mut self, record: &Record) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!(
            "recovery: discarding unfinished record id {} @{}",
            record.id(),
            record.address
        );

        #[cfg(feature = "debug-logs")]
        println!(
            "  recovery: discarding unfinished record id {} {:?}",
            record.id(),
            record.address
        );

        if record.header.value_length() > MAX_VALUE_LENGTH {
            self.clear_record_length(record.address)?;
        }
        self.set_key_state(record.address, KeyState::Invalid)
    }

    /// Resolves a record whose update or move got interrupted. The old value is kept unless
    /// its successor made it to `Valid`.
    fn recover_deleting_record(&mut self, record: &Record, allow_defrag: bool) -> Result<(), Error> {
        let id = record.id();

        if self.find_record(id, KeyState::Valid)?.is_some() {
            #[cfg(feature = "defmt")]
            trace!("recovery: id {} superseded, invalidating @{}", id, record.address);

            return self.set_key_state(record.address, KeyState::Invalid);
        }

        let data = self.read_payload(record)?;

        if let Some(successor) = self.find_record(id, KeyState::Writing)? {
            if self.can_complete(&successor, record, &data)? {
                #[cfg(feature = "defmt")]
                warn!(
                    "recovery: completing id {} @{} from @{}",
                    id, successor.address, record.address
                );

                self.complete_record(&successor, &data)?;
                return self.set_key_state(record.address, KeyState::Invalid);
            }
            self.discard_writing_record(&successor)?;
        }

        #[cfg(feature = "defmt")]
        warn!("recovery: re-submitting id {} from @{}", id, record.address);

        #[cfg(feature = "debug-logs")]
        println!("  recovery: re-submitting id {id} from {:?}", record.address);

        let destination = if allow_defrag {
            match self.alloc(data.len()) {
                Err(Error::NoEnoughSpace) => {
                    // defragmentation keeps a deleting record without successor, so it may
                    // already have carried this one over
                    self.defragment()?;
                    if self.read_record_header(record.address)? != record.header {
                        return Ok(());
                    }
                    self.alloc(data.len())?
                }
                other => other?,
            }
        } else {
            self.alloc_anywhere(data.len())?
        };

        self.write_record(destination, id, &data, record.header.writeable())?;
        self.set_key_state(record.address, KeyState::Invalid)
    }

    /// A `Writing` successor can be finished in place when it was started for the very same
    /// value: same header, and every payload bit the old value needs is still set.
    fn can_complete(&mut self, successor: &Record, record: &Record, data: &[u8]) -> Result<bool, Error> {
        if self.page_state(successor.address.page()) != ThinPageState::Using
            || successor.header.length != record.header.length
            || successor.header.writeable != record.header.writeable
        {
            return Ok(false);
        }

        let current = self.read_payload(successor)?;
        Ok(current
            .iter()
            .zip(data)
            .all(|(&current, &wanted)| current & wanted == wanted))
    }
}
