use crate::KeyValue;
use crate::error::Error;
use crate::internal::{RecordAddress, RecordCursor, ThinPageState};
use crate::platform::Platform;
use crate::raw::{KeyState, PageState};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, trace};

impl<T: Platform> KeyValue<T> {
    /// Compacts every page in use into the empty pages, one source page at a time. A source is
    /// marked `Defragging` first, then its valid records are moved and it is formatted, after
    /// which it serves as a destination for the pages behind it.
    pub(crate) fn defragment(&mut self) -> Result<(), Error> {
        let mut empty: Vec<u16> = (0..self.page_count())
            .filter(|&page| self.page_state(page) == ThinPageState::Empty)
            .collect();
        let using: Vec<u16> = (0..self.page_count())
            .filter(|&page| self.page_state(page) == ThinPageState::Using)
            .collect();

        #[cfg(feature = "defmt")]
        trace!("defrag: {} empty, {} in use", empty.len(), using.len());

        #[cfg(feature = "debug-logs")]
        println!("  defrag: empty {empty:?} using {using:?}");

        if empty.is_empty() {
            #[cfg(feature = "defmt")]
            error!("defrag: no empty page left");
            return Err(Error::NoEnoughSpace);
        }

        let mut target = 0;
        for source in using {
            self.set_page_state(source, PageState::Defragging)?;

            let mut cursor = RecordCursor::new(source);
            while let Some(record) = cursor.next(self)? {
                let keep = match record.state() {
                    Some(KeyState::Valid) => true,
                    // only left over while recovery re-submits an interrupted update
                    Some(KeyState::Deleting) => {
                        self.find_record(record.id(), KeyState::Valid)?.is_none()
                    }
                    _ => false,
                };
                if !keep {
                    continue;
                }

                let span = record.header.span().ok_or(Error::CorruptedData)?;
                let destination = loop {
                    let page = *empty.get(target).ok_or(Error::PageNotFound)?;
                    let thin = &self.pages[page as usize];
                    if thin.remaining() >= span {
                        break RecordAddress::new(page, thin.free_offset)
                            .ok_or(Error::PageNotFound)?;
                    }
                    target += 1;
                };

                self.move_record(destination, &record)?;
            }

            self.format_page(source)?;
            empty.push(source);
        }

        Ok(())
    }
}
