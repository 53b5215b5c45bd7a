use thiserror::Error;

/// Errors returned by the store and the cache. Marked as non-exhaustive to allow for future
/// additions. A caller usually only handles `KeyNotFound`, `PermissionDenied` and
/// `NoEnoughSpace`; the rest point at a broken flash or a bug.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the page size (4k)
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size has to be a multiple of the page size (4k)
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// Read and write granularity must be a power of two of at most 4 bytes and the erase size
    /// has to divide the page size.
    #[error("unsupported flash geometry")]
    UnsupportedFlash,

    /// A previous flash operation failed. Call `init()` to run recovery before using the store
    /// again.
    #[error("store not initialized")]
    NotInit,

    #[error("flash write failed")]
    WriteError,

    #[error("flash read failed")]
    ReadError,

    /// Erasing a page failed
    #[error("flash erase failed")]
    FlashError,

    /// The partition has to span at least two pages, one of them is kept free for defragmentation
    #[error("too few pages")]
    TooFewPages,

    /// Defragmentation ran out of destination pages
    #[error("page not found")]
    PageNotFound,

    /// No valid record exists for the id. This is the normal outcome for ids that were never
    /// written or have been deleted.
    #[error("key not found")]
    KeyNotFound,

    /// A page state was asked to move backwards
    #[error("illegal page state transition")]
    PageStateError,

    /// A record state was asked to move backwards
    #[error("illegal key state transition")]
    KeyStateError,

    /// The record was stored as read-only
    #[error("permission denied")]
    PermissionDenied,

    /// Even after defragmentation there is no room for the record
    #[error("not enough space")]
    NoEnoughSpace,

    /// Values are limited to `MAX_VALUE_LENGTH` bytes, one page minus headers
    #[error("value too long")]
    TooLong,

    /// A cache entry could not be allocated
    #[error("out of memory")]
    NoMem,

    /// The stored bytes do not decode as the requested type
    #[error("corrupted data")]
    CorruptedData,
}

impl Error {
    /// Errors reported by the flash driver itself. After one of these the on-flash state may
    /// hold half-finished records that only recovery resolves.
    pub(crate) fn is_physical(&self) -> bool {
        matches!(self, Error::WriteError | Error::ReadError | Error::FlashError)
    }
}
