//! Segment decoding pipeline.
//!
//! A [`SegmentDecoder`] wraps the byte stream of one fetched segment and produces the
//! decoded stream. Decoders are registered per [`EncryptionMode`] in a
//! [`DecoderRegistry`]; `EncryptionMode::None` never needs one.
//!
//! Decoders work on a boxed stream so the trait stays object-safe. Segment sizes in
//! metadata describe decoded bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};

#[cfg(feature = "aes-decrypt")]
use aes::Aes128;
#[cfg(feature = "aes-decrypt")]
use cbc::{
    Decryptor,
    cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7},
};

use crate::error::{Error, Result};
use crate::model::EncryptionMode;

/// A boxed stream of segment byte chunks.
pub type SegmentByteStream = BoxStream<'static, Result<Bytes>>;

/// What a decoder knows about the segment it is decoding.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub remote_id: &'a str,
    pub segment_index: usize,
    pub password: Option<&'a str>,
}

/// Transforms the byte stream of one segment.
pub trait SegmentDecoder: Send + Sync {
    fn apply(&self, ctx: &DecodeContext<'_>, input: SegmentByteStream) -> SegmentByteStream;
}

/// Decodes a fully fetched body.
pub async fn decode_segment(
    decoder: &dyn SegmentDecoder,
    ctx: &DecodeContext<'_>,
    body: Bytes,
) -> Result<Bytes> {
    let input = stream::once(async move { Ok(body) }).boxed();
    let mut out = decoder.apply(ctx, input);

    let mut buf = BytesMut::new();
    while let Some(chunk) = out.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Decoders keyed by encryption mode.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<EncryptionMode, Arc<dyn SegmentDecoder>>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("modes", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `decoder` for `mode`, replacing any previous one.
    pub fn register(mut self, mode: EncryptionMode, decoder: Arc<dyn SegmentDecoder>) -> Self {
        self.decoders.insert(mode, decoder);
        self
    }

    /// Decoder for `mode`; `Ok(None)` for unencrypted files.
    pub fn resolve(&self, mode: EncryptionMode) -> Result<Option<Arc<dyn SegmentDecoder>>> {
        if mode == EncryptionMode::None {
            return Ok(None);
        }
        self.decoders
            .get(&mode)
            .cloned()
            .map(Some)
            .ok_or(Error::UnsupportedEncryption(mode))
    }
}

/// Derives `(key, iv)` for one segment.
pub type KeyResolver = dyn Fn(&DecodeContext<'_>) -> Result<([u8; 16], [u8; 16])> + Send + Sync;

/// AES-128-CBC decoder with PKCS#7 padding.
///
/// Buffers the whole segment and decrypts once at the end.
#[derive(Clone)]
pub struct Aes128CbcDecoder {
    keys: Arc<KeyResolver>,
}

impl Aes128CbcDecoder {
    /// Same key and IV for every segment.
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self::with_resolver(move |_| Ok((key, iv)))
    }

    /// Per-segment key material (e.g. derived from the file password).
    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn(&DecodeContext<'_>) -> Result<([u8; 16], [u8; 16])> + Send + Sync + 'static,
    {
        Self {
            keys: Arc::new(resolver),
        }
    }
}

impl fmt::Debug for Aes128CbcDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes128CbcDecoder").finish_non_exhaustive()
    }
}

impl SegmentDecoder for Aes128CbcDecoder {
    fn apply(&self, ctx: &DecodeContext<'_>, input: SegmentByteStream) -> SegmentByteStream {
        let (key, iv) = match (self.keys)(ctx) {
            Ok(material) => material,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        decrypt_stream(key, iv, input)
    }
}

#[cfg(feature = "aes-decrypt")]
fn decrypt_stream(key: [u8; 16], iv: [u8; 16], input: SegmentByteStream) -> SegmentByteStream {
    stream::unfold(
        (input, BytesMut::new(), false),
        move |(mut input, mut buf, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match input.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (input, BytesMut::new(), true))),
                    None => {
                        if buf.is_empty() {
                            return None;
                        }
                        let mut data = buf.to_vec();
                        let decryptor = Decryptor::<Aes128>::new((&key).into(), (&iv).into());
                        let result = decryptor
                            .decrypt_padded_mut::<Pkcs7>(&mut data)
                            .map(Bytes::copy_from_slice)
                            .map_err(|e| {
                                Error::Decode(format!("AES-128-CBC decryption failed: {e}"))
                            });
                        return Some((result, (input, BytesMut::new(), true)));
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(not(feature = "aes-decrypt"))]
fn decrypt_stream(_key: [u8; 16], _iv: [u8; 16], _input: SegmentByteStream) -> SegmentByteStream {
    stream::once(async { Err(Error::Decode("built without the `aes-decrypt` feature".into())) })
        .boxed()
}
