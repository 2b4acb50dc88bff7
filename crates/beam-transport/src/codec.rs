//! Record layer: length-delimited frames sealed with ChaCha20-Poly1305.
//!
//! Each direction has its own key and a 64-bit frame counter used as the
//! nonce, so frames cannot be replayed, reordered or dropped silently.
use std::io;

use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Poly1305 authentication tag length.
pub(crate) const TAG_LEN: usize = 16;

fn frame_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .new_codec()
}

fn next_nonce(counter: &mut u64) -> io::Result<Nonce> {
    let current = *counter;
    *counter = current
        .checked_add(1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "frame counter exhausted"))?;

    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&current.to_le_bytes());
    Ok(Nonce::from(nonce))
}

/// Encrypting half of the record layer.
pub struct SealCodec {
    frames: LengthDelimitedCodec,
    cipher: ChaCha20Poly1305,
    counter: u64,
    max_plaintext: usize,
}

impl SealCodec {
    pub(crate) fn new(key: [u8; 32], max_frame_size: usize) -> Self {
        Self {
            frames: frame_codec(max_frame_size),
            cipher: ChaCha20Poly1305::new(&key.into()),
            counter: 0,
            max_plaintext: max_frame_size.saturating_sub(TAG_LEN).max(1),
        }
    }
}

impl std::fmt::Debug for SealCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealCodec")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl Encoder<Bytes> for SealCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for chunk in item.chunks(self.max_plaintext) {
            let nonce = next_nonce(&mut self.counter)?;
            let sealed = self
                .cipher
                .encrypt(&nonce, chunk)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "frame encryption failed"))?;
            self.frames.encode(Bytes::from(sealed), dst)?;
        }
        Ok(())
    }
}

/// Decrypting half of the record layer.
pub struct OpenCodec {
    frames: LengthDelimitedCodec,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl OpenCodec {
    pub(crate) fn new(key: [u8; 32], max_frame_size: usize) -> Self {
        Self {
            frames: frame_codec(max_frame_size),
            cipher: ChaCha20Poly1305::new(&key.into()),
            counter: 0,
        }
    }
}

impl std::fmt::Debug for OpenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCodec")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl Decoder for OpenCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };

        let nonce = next_nonce(&mut self.counter)?;
        let plain = self
            .cipher
            .decrypt(&nonce, frame.as_ref())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame authentication failed"))?;

        Ok(Some(Bytes::from(plain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn seal_then_open() {
        let mut seal = SealCodec::new(KEY, 1024);
        let mut open = OpenCodec::new(KEY, 1024);

        let mut buffer = BytesMut::new();
        seal.encode(Bytes::from_static(b"hello"), &mut buffer).unwrap();
        seal.encode(Bytes::from_static(b"world"), &mut buffer).unwrap();

        assert_eq!(open.decode(&mut buffer).unwrap().unwrap(), "hello");
        assert_eq!(open.decode(&mut buffer).unwrap().unwrap(), "world");
        assert!(open.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn large_items_are_split_into_frames() {
        let mut seal = SealCodec::new(KEY, 64);
        let mut open = OpenCodec::new(KEY, 64);

        let payload = vec![7u8; 200];
        let mut buffer = BytesMut::new();
        seal.encode(Bytes::from(payload.clone()), &mut buffer).unwrap();

        let mut out = Vec::new();
        while let Some(chunk) = open.decode(&mut buffer).unwrap() {
            assert!(chunk.len() <= 64 - TAG_LEN);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn wrong_key_fails() {
        let mut seal = SealCodec::new(KEY, 1024);
        let mut open = OpenCodec::new([0x43; 32], 1024);

        let mut buffer = BytesMut::new();
        seal.encode(Bytes::from_static(b"secret"), &mut buffer).unwrap();

        let err = open.decode(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn tampered_frame_fails() {
        let mut seal = SealCodec::new(KEY, 1024);
        let mut open = OpenCodec::new(KEY, 1024);

        let mut buffer = BytesMut::new();
        seal.encode(Bytes::from_static(b"secret"), &mut buffer).unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xff;

        assert!(open.decode(&mut buffer).is_err());
    }

    #[test]
    fn dropped_frame_is_detected() {
        let mut seal = SealCodec::new(KEY, 1024);
        let mut open = OpenCodec::new(KEY, 1024);

        let mut first = BytesMut::new();
        seal.encode(Bytes::from_static(b"one"), &mut first).unwrap();
        let mut second = BytesMut::new();
        seal.encode(Bytes::from_static(b"two"), &mut second).unwrap();

        // Skipping frame one desynchronises the nonce counter.
        assert!(open.decode(&mut second).is_err());
    }

    #[test]
    fn empty_item_writes_nothing() {
        let mut seal = SealCodec::new(KEY, 1024);
        let mut buffer = BytesMut::new();
        seal.encode(Bytes::new(), &mut buffer).unwrap();
        assert!(buffer.is_empty());
    }
}
