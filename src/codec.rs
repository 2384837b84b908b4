//! Binary record codec.
//!
//! Frame layout: `[compressed length (u32 LE)][zlib payload]`. Frames can be
//! concatenated and parsed back until the buffer is exhausted.
//!
//! Payload layout, all little endian:
//! `id, content, tags, metadata, importance (f32), created_at (f64),
//! updated_at (f64), source, embedding, encrypted (u8)`.
//! Every variable-length field starts with a u32 count; `u32::MAX` marks an
//! absent value so that empty and absent stay distinct.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{MemError, Result};
use crate::model::{Metadata, Record};

const ABSENT: u32 = u32::MAX;
/// Upper bound on a decompressed payload.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

pub fn encode(record: &Record) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(128 + record.content.len());
    put_str(&mut raw, &record.id)?;
    put_str(&mut raw, &record.content)?;
    put_list(&mut raw, record.tags.as_deref())?;
    put_map(&mut raw, record.metadata.as_ref())?;
    raw.extend_from_slice(&record.importance.to_le_bytes());
    raw.extend_from_slice(&record.created_at.to_le_bytes());
    raw.extend_from_slice(&record.updated_at.to_le_bytes());
    put_str(&mut raw, &record.source)?;
    put_vector(&mut raw, record.embedding.as_deref())?;
    raw.push(u8::from(record.encrypted));

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&checked_len(compressed.len())?.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decodes the frame starting at `offset`, returning the record and the
/// offset of the next frame.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(Record, usize)> {
    let mut frame = Reader::new(bytes, offset);
    let len = frame.u32()? as usize;
    let compressed = frame.take(len)?;
    let next = frame.pos;

    let raw = inflate(compressed, MAX_PAYLOAD_LEN)?;

    let mut r = Reader::new(&raw, 0);
    let id = r.string()?.ok_or_else(|| corrupt("record has no id"))?;
    let content = r.string()?.unwrap_or_default();
    let tags = r.list()?;
    let metadata = r.map()?;
    let importance = r.f32()?;
    let created_at = r.f64()?;
    let updated_at = r.f64()?;
    let source = r.string()?.unwrap_or_default();
    let embedding = r.vector()?;
    let encrypted = r.u8()? != 0;

    let record = Record {
        id,
        content,
        tags,
        metadata,
        importance,
        created_at,
        updated_at,
        source,
        embedding,
        encrypted,
    };
    Ok((record, next))
}

pub fn encode_stream<'a, I>(records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&encode(record)?);
    }
    Ok(out)
}

pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (record, next) = decode(bytes, offset)?;
        records.push(record);
        offset = next;
    }
    Ok(records)
}

pub fn write_record(path: &Path, record: &Record) -> Result<()> {
    write_atomic(path, &encode(record)?)
}

pub fn read_record(path: &Path) -> Result<Record> {
    let bytes = fs::read(path)?;
    decode(&bytes, 0).map(|(record, _)| record)
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn inflate(compressed: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed)
        .take(limit + 1)
        .read_to_end(&mut raw)
        .map_err(|e| corrupt(format!("decompression failed: {}", e)))?;
    if raw.len() as u64 > limit {
        return Err(corrupt(format!("payload inflates past {} bytes", limit)));
    }
    Ok(raw)
}

fn corrupt(msg: impl Into<String>) -> MemError {
    MemError::CorruptRecord(msg.into())
}

fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|l| *l != ABSENT)
        .ok_or_else(|| MemError::Validation(format!("field too large to encode ({} bytes)", len)))
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    buf.extend_from_slice(&checked_len(s.len())?.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_list(buf: &mut Vec<u8>, items: Option<&[String]>) -> Result<()> {
    match items {
        None => buf.extend_from_slice(&ABSENT.to_le_bytes()),
        Some(items) => {
            buf.extend_from_slice(&checked_len(items.len())?.to_le_bytes());
            for item in items {
                put_str(buf, item)?;
            }
        }
    }
    Ok(())
}

fn put_map(buf: &mut Vec<u8>, map: Option<&Metadata>) -> Result<()> {
    match map {
        None => buf.extend_from_slice(&ABSENT.to_le_bytes()),
        Some(map) => {
            buf.extend_from_slice(&checked_len(map.len())?.to_le_bytes());
            for (k, v) in map {
                put_str(buf, k)?;
                put_str(buf, v)?;
            }
        }
    }
    Ok(())
}

fn put_vector(buf: &mut Vec<u8>, vector: Option<&[f32]>) -> Result<()> {
    match vector {
        None => buf.extend_from_slice(&ABSENT.to_le_bytes()),
        Some(vector) => {
            buf.extend_from_slice(&checked_len(vector.len())?.to_le_bytes());
            for val in vector {
                buf.extend_from_slice(&val.to_le_bytes());
            }
        }
    }
    Ok(())
}

/// Bounds-checked cursor. Every declared length is validated against the
/// remaining buffer before anything is allocated.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                corrupt(format!(
                    "declared length {} exceeds remaining {} bytes",
                    n,
                    self.remaining()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        <[u8; N]>::try_from(self.take(N)?).map_err(|_| corrupt("short read"))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Reads a count; `None` for the absent sentinel. `min_item` is the
    /// smallest encoded size of one element.
    fn count(&mut self, min_item: usize) -> Result<Option<usize>> {
        let n = self.u32()?;
        if n == ABSENT {
            return Ok(None);
        }
        let n = n as usize;
        if n.saturating_mul(min_item) > self.remaining() {
            return Err(corrupt(format!(
                "declared count {} exceeds remaining {} bytes",
                n,
                self.remaining()
            )));
        }
        Ok(Some(n))
    }

    fn string(&mut self) -> Result<Option<String>> {
        match self.count(1)? {
            None => Ok(None),
            Some(len) => {
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Some)
                    .map_err(|e| corrupt(format!("invalid utf-8: {}", e)))
            }
        }
    }

    fn required_string(&mut self) -> Result<String> {
        self.string()?.ok_or_else(|| corrupt("unexpected absent string"))
    }

    fn list(&mut self) -> Result<Option<Vec<String>>> {
        let Some(n) = self.count(4)? else { return Ok(None) };
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.required_string()?);
        }
        Ok(Some(items))
    }

    fn map(&mut self) -> Result<Option<Metadata>> {
        let Some(n) = self.count(8)? else { return Ok(None) };
        let mut map = Metadata::new();
        for _ in 0..n {
            let k = self.required_string()?;
            let v = self.required_string()?;
            map.insert(k, v);
        }
        Ok(Some(map))
    }

    fn vector(&mut self) -> Result<Option<Vec<f32>>> {
        let Some(n) = self.count(4)? else { return Ok(None) };
        let mut vector = Vec::with_capacity(n);
        for _ in 0..n {
            vector.push(self.f32()?);
        }
        Ok(Some(vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            id: "rec-1".into(),
            content: "hello world".into(),
            tags: Some(vec!["a".into(), "b".into()]),
            metadata: Some(Metadata::from([("k".to_string(), "v".to_string())])),
            importance: 0.6,
            created_at: 1_700_000_000.25,
            updated_at: 1_700_000_001.5,
            source: "unit".into(),
            embedding: Some(vec![0.5, -1.0, 2.25]),
            encrypted: false,
        }
    }

    fn frame(raw: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let compressed = encoder.finish().unwrap();
        let mut out = (compressed.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&compressed);
        out
    }

    #[test]
    fn record_survives_codec() {
        let record = sample();
        let bytes = encode(&record).unwrap();
        let (decoded, next) = decode(&bytes, 0).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn empty_and_absent_stay_distinct() {
        let mut empty = sample();
        empty.tags = Some(vec![]);
        empty.metadata = Some(Metadata::new());
        empty.embedding = Some(vec![]);

        let mut absent = sample();
        absent.tags = None;
        absent.metadata = None;
        absent.embedding = None;
        absent.encrypted = true;

        let (e, _) = decode(&encode(&empty).unwrap(), 0).unwrap();
        let (a, _) = decode(&encode(&absent).unwrap(), 0).unwrap();
        assert_eq!(e, empty);
        assert_eq!(a, absent);
        assert_ne!(e.tags, a.tags);
    }

    #[test]
    fn concatenated_frames_parse_until_exhausted() {
        let mut second = sample();
        second.id = "rec-2".into();
        second.content = "second".into();
        let bytes = encode_stream([&sample(), &second]).unwrap();
        let records = decode_stream(&bytes).unwrap();
        assert_eq!(records, vec![sample(), second]);
    }

    #[test]
    fn truncated_frame_is_corrupt() {
        let bytes = encode(&sample()).unwrap();
        let err = decode(&bytes[..bytes.len() - 3], 0).unwrap_err();
        assert!(matches!(err, MemError::CorruptRecord(_)));
    }

    #[test]
    fn oversized_inner_length_is_corrupt() {
        let mut raw = 1_000_000u32.to_le_bytes().to_vec();
        raw.extend_from_slice(b"short");
        let err = decode(&frame(&raw), 0).unwrap_err();
        assert!(matches!(err, MemError::CorruptRecord(_)));
    }

    #[test]
    fn garbage_payload_is_corrupt() {
        let mut bytes = 8u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert!(matches!(decode(&bytes, 0), Err(MemError::CorruptRecord(_))));
        assert!(matches!(decode(&[], 0), Err(MemError::CorruptRecord(_))));
    }

    #[test]
    fn file_helpers_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rec-1.mem");
        write_record(&path, &sample()).unwrap();
        assert_eq!(read_record(&path).unwrap(), sample());
        assert!(!path.with_extension("tmp").exists());
    }

    fn zlib(raw: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn inflate_stops_at_the_limit() {
        let compressed = zlib(&[0u8; 4096]);
        assert_eq!(inflate(&compressed, 4096).unwrap().len(), 4096);
        assert!(matches!(inflate(&compressed, 1024), Err(MemError::CorruptRecord(_))));
    }

    #[test]
    fn oversized_payload_is_corrupt() {
        let compressed = zlib(&vec![0u8; MAX_PAYLOAD_LEN as usize + 1]);
        let mut bytes = (compressed.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&compressed);
        assert!(matches!(decode(&bytes, 0), Err(MemError::CorruptRecord(_))));
    }
}
