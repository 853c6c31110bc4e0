//! Payload codec boundary
//!
//! Layer RPC tidak pernah melihat isi payload; yang dibutuhkan hanya
//! serialize, deserialize, dan panjang byte.

use std::ops::{Deref, DerefMut};

use bytes::Bytes;

use crate::error::CodecError;

/// Pesan yang bisa dibawa sebagai payload RPC
pub trait RpcMessage: Sized + Send + 'static {
    fn serialize(&self) -> Result<Vec<u8>, CodecError>;

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Panjang hasil `serialize`
    fn byte_len(&self) -> usize;
}

impl RpcMessage for Vec<u8> {
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }

    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl RpcMessage for Bytes {
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.to_vec())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn byte_len(&self) -> usize {
        self.len()
    }
}

/// UTF-8 mentah, tanpa prefix panjang
impl RpcMessage for String {
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Payload(e.to_string()))
    }

    fn byte_len(&self) -> usize {
        self.len()
    }
}

/// Adapter postcard untuk tipe serde apa pun
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Postcard<T>(pub T);

impl<T> Postcard<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Postcard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Postcard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> RpcMessage for Postcard<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_stdvec(&self.0).map_err(|e| CodecError::Payload(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes)
            .map(Postcard)
            .map_err(|e| CodecError::Payload(e.to_string()))
    }

    fn byte_len(&self) -> usize {
        self.serialize().map(|v| v.len()).unwrap_or(0)
    }
}
