#![forbid(unsafe_code)]
//! Growable binary writer and the matching cursor reader.
//!
//! All fixed-width values are big-endian. Short text (labels, property
//! names, trace ids) uses a 2-byte length prefix followed by modified UTF-8,
//! where NUL is encoded as `0xC0 0x80` and supplementary characters are
//! written as UTF-16 surrogate pairs of three bytes each.

use bytes::Bytes;

use crate::types::{Result, TesseraError};

/// Longest encoded text accepted by [`ByteWriter::put_utf`].
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

/// Positional binary writer that grows on demand.
///
/// Bytes between the high-water mark and the allocated capacity are zeroed,
/// so writing past the end leaves no uninitialised gaps.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
    len: usize,
}

macro_rules! fixed_width {
    ($write:ident, $put:ident, $ty:ty) => {
        #[doc = concat!("Writes a big-endian `", stringify!($ty), "` at `offset`.")]
        pub fn $write(&mut self, offset: usize, v: $ty) {
            let raw = v.to_be_bytes();
            self.write_raw(offset, &raw);
        }

        #[doc = concat!("Appends a big-endian `", stringify!($ty), "` at the write cursor.")]
        pub fn $put(&mut self, v: $ty) {
            let off = self.len;
            self.$write(off, v);
        }
    };
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with `capacity` zeroed bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    /// Makes sure `len` bytes starting at `offset` are addressable.
    pub fn ensure_capacity(&mut self, offset: usize, len: usize) {
        let need = offset.saturating_add(len);
        if need <= self.buf.len() {
            return;
        }
        let grown = need.max(self.buf.len().saturating_mul(2)).max(16);
        self.buf.resize(grown, 0);
    }

    /// Number of bytes written so far (the high-water mark).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies raw bytes to `offset`, growing the buffer if required.
    pub fn write_raw(&mut self, offset: usize, src: &[u8]) {
        self.ensure_capacity(offset, src.len());
        self.buf[offset..offset + src.len()].copy_from_slice(src);
        self.len = self.len.max(offset + src.len());
    }

    fixed_width!(write_u8, put_u8, u8);
    fixed_width!(write_u16, put_u16, u16);
    fixed_width!(write_u32, put_u32, u32);
    fixed_width!(write_u64, put_u64, u64);
    fixed_width!(write_i16, put_i16, i16);
    fixed_width!(write_i32, put_i32, i32);
    fixed_width!(write_i64, put_i64, i64);
    fixed_width!(write_f32, put_f32, f32);
    fixed_width!(write_f64, put_f64, f64);

    /// Appends `1` for true and `0` for false.
    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    /// Appends raw bytes at the write cursor.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let off = self.len;
        self.write_raw(off, src);
    }

    /// Appends a `u32` length followed by the bytes.
    pub fn put_len_prefixed(&mut self, src: &[u8]) -> Result<()> {
        let len = u32::try_from(src.len())
            .map_err(|_| TesseraError::Invalid("length-prefixed field exceeds u32"))?;
        self.put_u32(len);
        self.put_bytes(src);
        Ok(())
    }

    /// Appends text with a 2-byte length prefix in modified UTF-8.
    pub fn put_utf(&mut self, value: &str) -> Result<()> {
        let encoded = encode_modified_utf8(value);
        if encoded.len() > MAX_UTF_LEN {
            return Err(TesseraError::InvalidOwned(format!(
                "encoded text is {} bytes, limit is {MAX_UTF_LEN}",
                encoded.len()
            )));
        }
        self.put_u16(encoded.len() as u16);
        self.put_bytes(&encoded);
        Ok(())
    }

    /// Shrinks the buffer to exactly `exact_len` bytes and freezes it.
    pub fn finish(mut self, exact_len: usize) -> Result<Bytes> {
        if exact_len > self.buf.len() {
            return Err(TesseraError::Invalid("finish length beyond written buffer"));
        }
        self.buf.truncate(exact_len);
        Ok(Bytes::from(self.buf))
    }

    /// Freezes everything written so far.
    pub fn into_bytes(mut self) -> Bytes {
        self.buf.truncate(self.len);
        Bytes::from(self.buf)
    }
}

/// Cursor over an immutable byte slice.
///
/// Every short read fails with [`TesseraError::MalformedOperation`] naming
/// the context the reader was created for.
pub struct ByteReader<'a> {
    src: &'a [u8],
    pos: usize,
    context: &'static str,
}

macro_rules! fixed_read {
    ($get:ident, $ty:ty) => {
        #[doc = concat!("Reads a big-endian `", stringify!($ty), "`.")]
        pub fn $get(&mut self) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let raw = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(raw);
            Ok(<$ty>::from_be_bytes(arr))
        }
    };
}

impl<'a> ByteReader<'a> {
    /// Creates a reader; `context` names the structure being decoded.
    pub fn new(src: &'a [u8], context: &'static str) -> Self {
        Self {
            src,
            pos: 0,
            context,
        }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TesseraError::malformed(format!(
                "{}: truncated at byte {} (wanted {n}, have {})",
                self.context,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fixed_read!(get_u8, u8);
    fixed_read!(get_u16, u16);
    fixed_read!(get_u32, u32);
    fixed_read!(get_u64, u64);
    fixed_read!(get_i16, i16);
    fixed_read!(get_i32, i32);
    fixed_read!(get_i64, i64);
    fixed_read!(get_f32, f32);
    fixed_read!(get_f64, f64);

    /// Reads a byte written by [`ByteWriter::put_bool`].
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TesseraError::malformed(format!(
                "{}: invalid bool byte {other}",
                self.context
            ))),
        }
    }

    /// Reads a `u32`-length-prefixed byte string.
    pub fn get_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Reads text written by [`ByteWriter::put_utf`].
    pub fn get_utf(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let raw = self.take(len)?;
        decode_modified_utf8(raw).ok_or_else(|| {
            TesseraError::malformed(format!("{}: invalid modified UTF-8", self.context))
        })
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(TesseraError::malformed(format!(
                "{}: {} trailing bytes",
                self.context,
                self.remaining()
            )));
        }
        Ok(())
    }
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn decode_modified_utf8(src: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b0 = src[i];
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return None;
            }
            units.push(u16::from(b0));
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *src.get(i + 1)?;
            if b1 & 0xC0 != 0x80 {
                return None;
            }
            units.push((u16::from(b0 & 0x1F) << 6) | u16::from(b1 & 0x3F));
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *src.get(i + 1)?;
            let b2 = *src.get(i + 2)?;
            if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                return None;
            }
            units.push(
                (u16::from(b0 & 0x0F) << 12) | (u16::from(b1 & 0x3F) << 6) | u16::from(b2 & 0x3F),
            );
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}
