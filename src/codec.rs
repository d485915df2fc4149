// src/codec.rs
//! Bucket wire codec: a field-tagged, length-prefixed binary record behind a
//! one-byte compression discriminator.
//!
//! Layout:
//! - byte 0: compression discriminator (0x00 = none, 0x01 = zstd)
//! - rest: the record, zstd-framed when the discriminator says so
//!
//! Record fields (protobuf-compatible wire types, varint tags):
//! - field 1: bucket key (bytes)
//! - field 2: repeated item pair {1: id, 2: payload}
//! - field 3: repeated child pair {1: shard label, 2: nested record}
//!
//! Entries written before the discriminator was introduced start directly
//! with a record tag byte; decode treats any unknown first byte as that
//! legacy form. Unknown fields are preserved and re-emitted on encode.

use crate::bucket::Bucket;
use crate::error::{Error, Result};

pub const COMPRESSION_NONE: u8 = 0x00;
pub const COMPRESSION_ZSTD: u8 = 0x01;

const ZSTD_LEVEL: i32 = 3;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

const FIELD_KEY: u64 = 1;
const FIELD_ITEM: u64 = 2;
const FIELD_CHILD: u64 = 3;

// Sub-fields of item and child pairs.
const FIELD_PAIR_NAME: u64 = 1;
const FIELD_PAIR_VALUE: u64 = 2;

/// Serializes and compresses a bucket for storage.
pub fn encode(bucket: &Bucket) -> Result<Vec<u8>> {
    let record = encode_record(bucket);
    let compressed = zstd::encode_all(record.as_slice(), ZSTD_LEVEL)
        .map_err(|e| Error::Internal(format!("failed to compress bucket: {e}")))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(COMPRESSION_ZSTD);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decodes a stored bucket payload, transparently decompressing and
/// accepting legacy uncompressed entries.
pub fn decode(data: &[u8]) -> Result<Bucket> {
    let Some((&discriminator, rest)) = data.split_first() else {
        return Err(Error::CorruptBucket("empty payload".to_string()));
    };
    match discriminator {
        COMPRESSION_ZSTD => {
            let record = zstd::decode_all(rest)
                .map_err(|e| Error::CorruptBucket(format!("failed to decompress bucket: {e}")))?;
            decode_record(&record)
        }
        COMPRESSION_NONE => decode_record(rest),
        // Legacy entries were written without a discriminator byte.
        _ => decode_record(data),
    }
}

/// Serializes a bucket to its raw record form, without compression. Map
/// fields iterate in sorted order, so equal buckets encode to equal bytes.
pub fn encode_record(bucket: &Bucket) -> Vec<u8> {
    let mut buf = Vec::new();
    if !bucket.key.is_empty() {
        put_field(&mut buf, FIELD_KEY, bucket.key.as_bytes());
    }
    for (id, payload) in &bucket.items {
        let mut pair = Vec::with_capacity(id.len() + payload.len() + 8);
        put_field(&mut pair, FIELD_PAIR_NAME, id.as_bytes());
        put_field(&mut pair, FIELD_PAIR_VALUE, payload);
        put_field(&mut buf, FIELD_ITEM, &pair);
    }
    for (label, child) in &bucket.children {
        let mut pair = Vec::new();
        put_field(&mut pair, FIELD_PAIR_NAME, label.as_bytes());
        put_field(&mut pair, FIELD_PAIR_VALUE, &encode_record(child));
        put_field(&mut buf, FIELD_CHILD, &pair);
    }
    buf.extend_from_slice(&bucket.unknown);
    buf
}

/// Parses a raw record into a bucket. Fields this version does not know are
/// kept verbatim in `bucket.unknown`.
pub fn decode_record(data: &[u8]) -> Result<Bucket> {
    let mut reader = Reader::new(data);
    let mut bucket = Bucket::default();
    while !reader.done() {
        let field_start = reader.pos;
        let tag = reader.varint()?;
        let field = tag >> 3;
        let wire = tag & 0x7;
        match (field, wire) {
            (FIELD_KEY, WIRE_LEN) => {
                bucket.key = reader.string()?;
            }
            (FIELD_ITEM, WIRE_LEN) => {
                let pair = reader.len_delimited()?;
                let (id, payload) = decode_pair(pair)?;
                bucket.items.insert(id, payload);
            }
            (FIELD_CHILD, WIRE_LEN) => {
                let pair = reader.len_delimited()?;
                let (label, raw) = decode_pair(pair)?;
                bucket.children.insert(label, decode_record(&raw)?);
            }
            _ => {
                reader.skip(wire)?;
                bucket.unknown.extend_from_slice(&data[field_start..reader.pos]);
            }
        }
    }
    Ok(bucket)
}

/// Parses a two-field pair message: {1: name, 2: value}. Pairs carry no
/// other fields, so anything unknown inside one is skipped.
fn decode_pair(data: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut reader = Reader::new(data);
    let mut name = None;
    let mut value = None;
    while !reader.done() {
        let tag = reader.varint()?;
        match (tag >> 3, tag & 0x7) {
            (FIELD_PAIR_NAME, WIRE_LEN) => name = Some(reader.string()?),
            (FIELD_PAIR_VALUE, WIRE_LEN) => value = Some(reader.len_delimited()?.to_vec()),
            (_, wire) => reader.skip(wire)?,
        }
    }
    match name {
        Some(name) if !name.is_empty() => Ok((name, value.unwrap_or_default())),
        _ => Err(Error::CorruptBucket("pair entry is missing its name".to_string())),
    }
}

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_field(buf: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    put_varint(buf, field << 3 | WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(Error::CorruptBucket("truncated varint".to_string()));
            };
            self.pos += 1;
            if shift >= 64 {
                return Err(Error::CorruptBucket("varint overflows 64 bits".to_string()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::CorruptBucket("truncated field".to_string()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn len_delimited(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::CorruptBucket("field length overflows usize".to_string()))?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.len_delimited()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::CorruptBucket("field is not valid utf-8".to_string()))
    }

    fn skip(&mut self, wire: u64) -> Result<()> {
        match wire {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_FIXED64 => {
                self.take(8)?;
            }
            WIRE_LEN => {
                self.len_delimited()?;
            }
            WIRE_FIXED32 => {
                self.take(4)?;
            }
            _ => {
                return Err(Error::CorruptBucket(format!("unsupported wire type {wire}")));
            }
        }
        Ok(())
    }
}
