//! The `Get<T>` trait and its implementations in this module allow a single generic,
//! overloaded function `get<T>()` for all supported value types.

use crate::KeyValue;
use crate::error::Error;
use crate::platform::Platform;
use alloc::string::String;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, id: u16) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, id: u16) -> Result<T, Error> {
        (*self).get(id)
    }
}

impl<T: Platform> KeyValue<T> {
    /// Get a value and decode it.
    ///
    /// Supported types are bool, signed and unsigned integers up to 64-bit width (stored
    /// little-endian), String and `Vec<u8>`.
    pub fn get<R>(&mut self, id: u16) -> Result<R, Error>
    where
        KeyValue<T>: Get<R>,
    {
        Get::get(self, id)
    }

    fn get_fixed<const N: usize>(&mut self, id: u16) -> Result<[u8; N], Error> {
        let value = self.get_key(id)?;
        value.try_into().map_err(|_| Error::CorruptedData)
    }
}

impl<T: Platform> Get<bool> for KeyValue<T> {
    fn get(&mut self, id: u16) -> Result<bool, Error> {
        let [value] = self.get_fixed::<1>(id)?;
        Ok(value != 0)
    }
}

macro_rules! impl_get_int {
    ($($ty:ty),*) => {
        $(
            impl<T: Platform> Get<$ty> for KeyValue<T> {
                fn get(&mut self, id: u16) -> Result<$ty, Error> {
                    let bytes = self.get_fixed::<{ core::mem::size_of::<$ty>() }>(id)?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }
            }
        )*
    };
}

impl_get_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Platform> Get<Vec<u8>> for KeyValue<T> {
    fn get(&mut self, id: u16) -> Result<Vec<u8>, Error> {
        self.get_key(id)
    }
}

impl<T: Platform> Get<String> for KeyValue<T> {
    fn get(&mut self, id: u16) -> Result<String, Error> {
        let value = self.get_key(id)?;
        String::from_utf8(value).map_err(|_| Error::CorruptedData)
    }
}
