//! Write-back cache in front of [`KeyValue`].
//!
//! Reads are served from an LRU list bounded by a byte budget. Writes are queued and handed to
//! the flash by [`CachedKeyValue::flush`], usually called from the [`CachedKeyValue::run`]
//! background task. Every call goes through one blocking mutex, pick the raw mutex that fits
//! the executor (`CriticalSectionRawMutex` when shared with interrupts, `NoopRawMutex` within
//! a single task).

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::MAX_VALUE_LENGTH;
use crate::{KeyValue, KvStatistics, RecordInfo};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use lru::LruCache;
#[cfg(feature = "defmt")]
use defmt::{error, trace, warn};

/// Bytes of payload kept in the read list by default
pub const DEFAULT_READ_BUDGET: usize = 0x400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound for the payload bytes held in the read list. Values of this size or larger
    /// are never cached.
    pub read_budget: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_budget: DEFAULT_READ_BUDGET,
        }
    }
}

struct CachedKey {
    id: u16,
    writeable: bool,
    /// empty for a pending delete
    data: Vec<u8>,
}

impl CachedKey {
    fn try_new(id: u16, data: &[u8], writeable: bool) -> Result<Self, Error> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(data.len())
            .map_err(|_| Error::NoMem)?;
        buf.extend_from_slice(data);
        Ok(Self {
            id,
            writeable,
            data: buf,
        })
    }
}

struct CacheState<T: Platform> {
    store: KeyValue<T>,
    config: CacheConfig,
    read_list: LruCache<u16, CachedKey>,
    read_bytes: usize,
    write_list: VecDeque<CachedKey>,
    write_flush: bool,
}

impl<T: Platform> CacheState<T> {
    fn get(&mut self, id: u16) -> Result<Vec<u8>, Error> {
        if let Some(pending) = self.write_list.iter().find(|key| key.id == id) {
            if pending.data.is_empty() {
                return Err(Error::KeyNotFound);
            }
            return Ok(pending.data.clone());
        }

        if let Some(cached) = self.read_list.get(&id) {
            return Ok(cached.data.clone());
        }

        let (data, writeable) = self.store.load_key(id)?;
        if let Ok(entry) = CachedKey::try_new(id, &data, writeable) {
            self.insert_read(entry);
        }
        Ok(data)
    }

    /// Returns whether a flush has to be scheduled.
    fn set(&mut self, id: u16, data: &[u8], writeable: bool) -> Result<bool, Error> {
        if data.len() > MAX_VALUE_LENGTH {
            return Err(Error::TooLong);
        }

        if let Some(index) = self.write_list.iter().position(|key| key.id == id) {
            let pending = &self.write_list[index];
            if pending.data.is_empty() && data.is_empty() {
                return Err(Error::KeyNotFound);
            }
            if pending.data == data {
                return Ok(false);
            }
            // a queued delete leaves nothing to protect
            if !pending.writeable && !pending.data.is_empty() {
                return Err(Error::PermissionDenied);
            }

            return match CachedKey::try_new(id, data, writeable) {
                Ok(entry) => {
                    self.write_list[index] = entry;
                    Ok(true)
                }
                Err(Error::NoMem) => {
                    self.write_list.remove(index);
                    self.write_through(id, data, writeable)
                }
                Err(e) => Err(e),
            };
        }

        if let Some(cached) = self.read_list.peek(&id) {
            if cached.data == data {
                return Ok(false);
            }
            if !cached.writeable {
                return Err(Error::PermissionDenied);
            }
            self.remove_read(id);
        } else if data.is_empty() {
            let (_, stored_writeable) = self.store.load_key(id)?;
            if !stored_writeable {
                return Err(Error::PermissionDenied);
            }
        } else if !self.store.check_update(id, data)? {
            return Ok(false);
        }

        match CachedKey::try_new(id, data, writeable) {
            Ok(entry) => {
                #[cfg(feature = "defmt")]
                trace!("cache: queued id {} [{}]", id, data.len());

                self.write_list.push_back(entry);
                Ok(true)
            }
            Err(Error::NoMem) => self.write_through(id, data, writeable),
            Err(e) => Err(e),
        }
    }

    fn write_through(&mut self, id: u16, data: &[u8], writeable: bool) -> Result<bool, Error> {
        #[cfg(feature = "defmt")]
        warn!("cache: out of memory, writing id {} directly", id);

        self.store.set_key(id, data, writeable)?;
        Ok(false)
    }

    fn del(&mut self, id: u16) -> Result<(), Error> {
        self.remove_read(id);

        let mut dropped = false;
        if let Some(index) = self.write_list.iter().position(|key| key.id == id) {
            let pending = &self.write_list[index];
            if !pending.writeable && !pending.data.is_empty() {
                return Err(Error::PermissionDenied);
            }
            self.write_list.remove(index);
            dropped = true;
        }

        match self.store.del_key(id) {
            Err(Error::KeyNotFound) if dropped => Ok(()),
            other => other,
        }
    }

    /// Drains the write list in order. A flash error keeps the failing entry and everything
    /// behind it queued, entries the store rejects for good are dropped.
    fn flush(&mut self) -> Result<(), Error> {
        let mut result = Ok(());

        while let Some(entry) = self.write_list.pop_front() {
            let outcome = if entry.data.is_empty() {
                match self.store.del_key(entry.id) {
                    Err(Error::KeyNotFound) => Ok(()),
                    other => other,
                }
            } else {
                self.store.commit_key(entry.id, &entry.data, entry.writeable)
            };

            match outcome {
                Ok(()) => {
                    if !entry.data.is_empty() {
                        self.insert_read(entry);
                    }
                }
                Err(e) if e.is_physical() || e == Error::NotInit => {
                    #[cfg(feature = "defmt")]
                    error!("cache: flushing id {} failed: {}", entry.id, e);

                    self.write_list.push_front(entry);
                    result = result.and(Err(e));
                    break;
                }
                Err(e) => {
                    #[cfg(feature = "defmt")]
                    error!("cache: dropping id {}: {}", entry.id, e);

                    result = result.and(Err(e));
                }
            }
        }

        self.write_flush = false;
        result
    }

    fn insert_read(&mut self, entry: CachedKey) {
        self.remove_read(entry.id);

        let length = entry.data.len();
        if length >= self.config.read_budget {
            return;
        }

        while self.read_bytes + length > self.config.read_budget {
            match self.read_list.pop_lru() {
                Some((_, evicted)) => self.read_bytes -= evicted.data.len(),
                None => break,
            }
        }

        self.read_bytes += length;
        self.read_list.put(entry.id, entry);
    }

    fn remove_read(&mut self, id: u16) {
        if let Some(cached) = self.read_list.pop(&id) {
            self.read_bytes -= cached.data.len();
        }
    }

    fn clear(&mut self) {
        self.read_list.clear();
        self.read_bytes = 0;
        self.write_list.clear();
        self.write_flush = false;
    }
}

/// A [`KeyValue`] store behind a mutex, with a read cache and deferred writes.
pub struct CachedKeyValue<M: RawMutex, T: Platform> {
    state: Mutex<M, RefCell<CacheState<T>>>,
    flush_signal: Signal<M, ()>,
}

impl<M: RawMutex, T: Platform> CachedKeyValue<M, T> {
    pub fn new(store: KeyValue<T>, config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(CacheState {
                store,
                config,
                read_list: LruCache::unbounded(),
                read_bytes: 0,
                write_list: VecDeque::new(),
                write_flush: false,
            })),
            flush_signal: Signal::new(),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState<T>) -> R) -> R {
        self.state.lock(|state| f(&mut *state.borrow_mut()))
    }

    /// Returns the freshest value for `id`, pending writes included.
    pub fn get_key(&self, id: u16) -> Result<Vec<u8>, Error> {
        self.with_state(|state| state.get(id))
    }

    /// Queues `data` for `id` and schedules a flush. Empty data queues a delete.
    pub fn set_key(&self, id: u16, data: &[u8], writeable: bool) -> Result<(), Error> {
        if self.with_state(|state| state.set(id, data, writeable))? {
            self.request_flush();
        }
        Ok(())
    }

    /// Drops any cached or pending value and deletes the key on flash right away.
    pub fn del_key(&self, id: u16) -> Result<(), Error> {
        self.with_state(|state| state.del(id))
    }

    /// Writes every pending value to flash.
    pub fn flush(&self) -> Result<(), Error> {
        self.with_state(|state| state.flush())
    }

    /// Wakes the background task unless a flush is already on its way.
    pub fn request_flush(&self) {
        let post = self.with_state(|state| !core::mem::replace(&mut state.write_flush, true));
        if post {
            self.flush_signal.signal(());
        }
    }

    pub fn flush_requested(&self) -> bool {
        self.with_state(|state| state.write_flush)
    }

    pub fn pending_writes(&self) -> usize {
        self.with_state(|state| state.write_list.len())
    }

    /// Payload bytes currently held in the read list
    pub fn cached_bytes(&self) -> usize {
        self.with_state(|state| state.read_bytes)
    }

    /// Background task draining the write list whenever a flush was requested.
    pub async fn run(&self) {
        loop {
            self.flush_signal.wait().await;
            if let Err(_e) = self.flush() {
                #[cfg(feature = "defmt")]
                error!("cache: background flush failed: {}", _e);
            }
        }
    }

    /// Drops both lists and formats the whole partition.
    pub fn force_reset(&self) -> Result<(), Error> {
        self.with_state(|state| {
            state.clear();
            state.store.force_reset()
        })
    }

    /// Re-runs recovery after a flash error. Pending writes stay queued and get flushed again.
    pub fn init(&self) -> Result<(), Error> {
        let pending = self.with_state(|state| {
            state.store.init()?;
            Ok::<_, Error>(!state.write_list.is_empty())
        })?;
        if pending {
            self.request_flush();
        }
        Ok(())
    }

    pub fn dump_all_keys(&self) -> Result<Vec<RecordInfo>, Error> {
        self.with_state(|state| state.store.dump_all_keys())
    }

    pub fn statistics(&self) -> Result<KvStatistics, Error> {
        self.with_state(|state| state.store.statistics())
    }
}
