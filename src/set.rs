use crate::KeyValue;
use crate::error::Error;
use crate::platform::Platform;

pub trait Set<T> {
    fn set(&mut self, id: u16, value: T) -> Result<(), Error>;
}

impl<T, S: Set<T>> Set<T> for &mut S {
    fn set(&mut self, id: u16, value: T) -> Result<(), Error> {
        (*self).set(id, value)
    }
}

impl<T: Platform> KeyValue<T> {
    /// Encode a value and store it as writeable record.
    ///
    /// Type support:
    ///  * bool, signed and unsigned integers up to 64-bit width: little-endian bytes
    ///  * &str and &[u8]: as is, up to `MAX_VALUE_LENGTH` bytes. Empty values delete the key.
    pub fn set<R>(&mut self, id: u16, value: R) -> Result<(), Error>
    where
        KeyValue<T>: Set<R>,
    {
        Set::set(self, id, value)
    }
}

impl<T: Platform> Set<bool> for KeyValue<T> {
    fn set(&mut self, id: u16, value: bool) -> Result<(), Error> {
        self.set_key(id, &[value as u8], true)
    }
}

macro_rules! impl_set_int {
    ($($ty:ty),*) => {
        $(
            impl<T: Platform> Set<$ty> for KeyValue<T> {
                fn set(&mut self, id: u16, value: $ty) -> Result<(), Error> {
                    self.set_key(id, &value.to_le_bytes(), true)
                }
            }
        )*
    };
}

impl_set_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Platform> Set<&[u8]> for KeyValue<T> {
    fn set(&mut self, id: u16, value: &[u8]) -> Result<(), Error> {
        self.set_key(id, value, true)
    }
}

impl<T: Platform> Set<&str> for KeyValue<T> {
    fn set(&mut self, id: u16, value: &str) -> Result<(), Error> {
        self.set_key(id, value.as_bytes(), true)
    }
}
