//! Typed parameters
//!
//! Stores one serde value in the parameter payload, postcard encoded.

use core::marker::PhantomData;

use embassy_sync::blocking_mutex::raw::RawMutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use spinor_hal::RawFlash;

use super::record::PAYLOAD_SIZE;
use super::ParamStore;
use crate::error::Error;

/// A value of type `T` kept at a fixed payload offset
pub struct TypedParams<'a, M: RawMutex, F, T> {
    store: &'a ParamStore<M, F>,
    offset: usize,
    _value: PhantomData<fn() -> T>,
}

impl<'a, M, F, T> TypedParams<'a, M, F, T>
where
    M: RawMutex,
    F: RawFlash,
    T: Serialize + DeserializeOwned,
{
    /// Keep the value at the start of the payload
    pub fn new(store: &'a ParamStore<M, F>) -> Self {
        Self::at(store, 0)
    }

    /// Keep the value at `offset`; it may use the rest of the payload
    pub fn at(store: &'a ParamStore<M, F>, offset: usize) -> Self {
        Self {
            store,
            offset,
            _value: PhantomData,
        }
    }

    fn window(&self) -> Result<usize, Error> {
        PAYLOAD_SIZE
            .checked_sub(self.offset)
            .filter(|&len| len > 0)
            .ok_or(Error::InvalidRange)
    }

    /// Encode `value` and append it as a new record
    pub async fn save(&self, value: &T) -> Result<(), Error> {
        let mut buf = [0u8; PAYLOAD_SIZE];
        let window = self.window()?;
        let bytes = postcard::to_slice(value, &mut buf[..window]).map_err(|_| Error::Encode)?;
        trace!("dps: saving {} encoded bytes", bytes.len());
        self.store.write(self.offset, bytes).await
    }

    /// Decode the stored value
    pub async fn load(&self) -> Result<T, Error> {
        let mut buf = [0u8; PAYLOAD_SIZE];
        let window = self.window()?;
        self.store.read(self.offset, &mut buf[..window]).await?;
        postcard::from_bytes(&buf[..window]).map_err(|_| Error::Decode)
    }
}
