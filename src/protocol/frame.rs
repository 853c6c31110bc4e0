//! RPC framing
//!
//! Layout satu frame (tanpa delimiter antar frame):
//! ```text
//! [meta_len: i32 BE][meta: postcard RpcMeta][payload: data_size bytes]
//! ```
//! Frame dianggap lengkap hanya jika `readable >= 4 + meta_len + data_size`.
//! Frame yang belum lengkap dibiarkan di buffer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::Buffer;
use crate::error::CodecError;

/// Ukuran prefix panjang metadata
pub const META_LEN_SIZE: usize = 4;

/// Batas metadata; lebih dari ini dianggap stream rusak
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Metadata per pesan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMeta {
    /// Call id; response membawa id request-nya
    pub id: u64,
    pub service: String,
    pub method: String,
    /// Panjang payload dalam byte
    pub data_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub meta: RpcMeta,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        id: u64,
        service: impl Into<String>,
        method: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            meta: RpcMeta {
                id,
                service: service.into(),
                method: method.into(),
                // payload > u32::MAX ditolak saat encode
                data_size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            },
            payload,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Encode ke buffer baru; prefix panjang ditulis lewat cheap prepend
    pub fn encode(&self) -> Result<Buffer, CodecError> {
        let meta = self.encode_meta()?;
        let mut buf = Buffer::with_capacity(meta.len() + self.payload.len());
        buf.append(&meta);
        buf.append(&self.payload);
        buf.prepend_i32(meta.len() as i32);
        Ok(buf)
    }

    /// Encode di belakang isi `out` yang sudah ada
    pub fn encode_into(&self, out: &mut Buffer) -> Result<(), CodecError> {
        let meta = self.encode_meta()?;
        out.append_i32(meta.len() as i32);
        out.append(&meta);
        out.append(&self.payload);
        Ok(())
    }

    fn encode_meta(&self) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > u32::MAX as usize {
            return Err(CodecError::Payload(format!(
                "payload of {} bytes does not fit the frame",
                self.payload.len()
            )));
        }
        if self.meta.data_size as usize != self.payload.len() {
            return Err(CodecError::Payload(format!(
                "data_size {} does not match payload of {} bytes",
                self.meta.data_size,
                self.payload.len()
            )));
        }
        let meta = postcard::to_stdvec(&self.meta).map_err(|e| CodecError::Metadata(e.to_string()))?;
        if meta.len() > MAX_META_SIZE {
            return Err(CodecError::FrameTooLarge(meta.len()));
        }
        Ok(meta)
    }

    /// Ambil satu frame lengkap dari depan buffer.
    ///
    /// `Ok(None)` = butuh byte tambahan; buffer tidak disentuh.
    pub fn decode(buf: &mut Buffer) -> Result<Option<Frame>, CodecError> {
        if buf.readable_bytes() < META_LEN_SIZE {
            return Ok(None);
        }
        let meta_len = buf.peek_i32();
        if meta_len < 0 || meta_len as usize > MAX_META_SIZE {
            return Err(CodecError::FrameTooLarge(meta_len as u32 as usize));
        }
        let meta_len = meta_len as usize;
        let meta_end = META_LEN_SIZE + meta_len;
        if buf.readable_bytes() < meta_end {
            return Ok(None);
        }

        let meta: RpcMeta = postcard::from_bytes(&buf.peek()[META_LEN_SIZE..meta_end])
            .map_err(|e| CodecError::Metadata(e.to_string()))?;
        let total = meta_end + meta.data_size as usize;
        if buf.readable_bytes() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf.peek()[meta_end..total]);
        buf.retrieve(total);
        Ok(Some(Frame { meta, payload }))
    }

    /// Ambil semua frame lengkap; sisa frame parsial tetap di buffer
    pub fn decode_all(buf: &mut Buffer) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Frame {
        Frame::new(7, "EchoServer", "Echo", &b"hello rpc"[..])
    }

    #[test]
    fn test_encode_layout() {
        let frame = sample();
        let mut buf = frame.encode().unwrap();
        let meta = postcard::to_stdvec(&frame.meta).unwrap();

        assert_eq!(buf.readable_bytes(), 4 + meta.len() + 9);
        assert_eq!(buf.read_i32() as usize, meta.len());
        assert_eq!(&buf.peek()[..meta.len()], &meta[..]);
        assert_eq!(&buf.peek()[meta.len()..], b"hello rpc");
    }

    #[test]
    fn test_encode_into_matches_encode() {
        let frame = sample();
        let mut a = Buffer::new();
        frame.encode_into(&mut a).unwrap();
        let b = frame.encode().unwrap();
        assert_eq!(a.peek(), b.peek());
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let encoded = sample().encode().unwrap();
        let bytes = encoded.peek().to_vec();

        let mut buf = Buffer::new();
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(Frame::decode(&mut buf).unwrap(), None, "complete too early at {i}");
            assert_eq!(buf.readable_bytes(), i);
            buf.append(&[*b]);
        }
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(sample()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_all_keeps_trailing_partial() {
        let mut buf = Buffer::new();
        Frame::new(1, "S", "a", &b"one"[..]).encode_into(&mut buf).unwrap();
        Frame::new(2, "S", "b", Bytes::new()).encode_into(&mut buf).unwrap();
        let third = Frame::new(3, "S", "c", &b"three"[..]).encode().unwrap();
        buf.append(&third.peek()[..third.readable_bytes() - 2]);

        let frames = Frame::decode_all(&mut buf).unwrap();
        assert_eq!(frames.iter().map(Frame::id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(frames[0].payload, Bytes::from_static(b"one"));
        assert!(frames[1].payload.is_empty());
        assert_eq!(buf.readable_bytes(), third.readable_bytes() - 2);

        buf.append(&third.peek()[third.readable_bytes() - 2..]);
        let rest = Frame::decode_all(&mut buf).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].meta.method, "c");
    }

    #[test]
    fn test_oversized_meta_rejected() {
        let mut buf = Buffer::new();
        buf.append_i32((MAX_META_SIZE + 1) as i32);
        assert_eq!(
            Frame::decode(&mut buf),
            Err(CodecError::FrameTooLarge(MAX_META_SIZE + 1))
        );

        let mut buf = Buffer::new();
        buf.append_i32(-1);
        assert!(matches!(Frame::decode(&mut buf), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_garbage_meta_rejected() {
        let mut buf = Buffer::new();
        buf.append_i32(3);
        buf.append(&[0xff, 0xff, 0xff]);
        assert!(matches!(Frame::decode(&mut buf), Err(CodecError::Metadata(_))));
    }

    #[test]
    fn test_mismatched_data_size_rejected() {
        let mut frame = Frame::new(1, "S", "m", &b"four"[..]);
        assert_eq!(frame.meta.data_size, 4);
        frame.meta.data_size = 2;
        assert!(matches!(frame.encode(), Err(CodecError::Payload(_))));
        let mut out = Buffer::new();
        assert!(matches!(frame.encode_into(&mut out), Err(CodecError::Payload(_))));
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn prop_split_delivery_matches_single_chunk(
            id in any::<u64>(),
            service in "[A-Za-z]{1,16}",
            method in "[A-Za-z]{1,16}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            split in any::<prop::sample::Index>(),
        ) {
            let frame = Frame::new(id, service, method, payload);
            let encoded = frame.encode().unwrap();
            let bytes = encoded.peek();
            let at = split.index(bytes.len() + 1);

            let mut whole = Buffer::new();
            whole.append(bytes);
            let single = Frame::decode(&mut whole).unwrap();

            let mut chunked = Buffer::new();
            chunked.append(&bytes[..at]);
            let first = Frame::decode(&mut chunked).unwrap();
            if at < bytes.len() {
                prop_assert_eq!(first, None);
                chunked.append(&bytes[at..]);
                prop_assert_eq!(Frame::decode(&mut chunked).unwrap(), single.clone());
            } else {
                prop_assert_eq!(first, single.clone());
            }
            prop_assert_eq!(single, Some(frame));
            prop_assert!(chunked.is_empty());
        }
    }
}
