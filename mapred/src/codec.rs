//! The bucket record stream format.
//!
//! A record is framed as a 4-byte big-endian key length, the key bytes, a
//! 4-byte big-endian value length, and the value bytes. A zero-length key
//! together with a zero-length value is reserved as an end-of-stream
//! sentinel for streaming producers; sealed buckets may omit it, so readers
//! treat both the sentinel and a clean EOF as end of stream.

use std::io::{self, Read, Write};

pub type Record = (Vec<u8>, Vec<u8>);

pub fn write_record<W: Write>(w: &mut W, key: &[u8], value: &[u8]) -> io::Result<()> {
    w.write_all(&(key.len() as u32).to_be_bytes())?;
    w.write_all(key)?;
    w.write_all(&(value.len() as u32).to_be_bytes())?;
    w.write_all(value)
}

pub fn write_sentinel<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[0u8; 8])
}

/// Read the next record, or `None` at end of stream (clean EOF or sentinel).
/// A truncated frame is an error.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Option<Record>> {
    let mut len = [0u8; 4];
    if let Err(err) = r.read_exact(&mut len) {
        return if err.kind() == io::ErrorKind::UnexpectedEof { Ok(None) } else { Err(err) };
    }
    let key_len = u32::from_be_bytes(len) as usize;
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;

    r.read_exact(&mut len)?;
    let value_len = u32::from_be_bytes(len) as usize;
    let mut value = vec![0u8; value_len];
    r.read_exact(&mut value)?;

    if key_len == 0 && value_len == 0 {
        return Ok(None);
    }
    Ok(Some((key, value)))
}

/// Iterator over the records of a framed stream.
pub struct RecordReader<R> {
    inner: R,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(&mut self.inner) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

pub struct RecordWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        write_record(&mut self.inner, key, value)?;
        self.written += 8 + key.len() as u64 + value.len() as u64;
        Ok(())
    }

    /// Bytes framed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_is_identity() {
        let records: Vec<Record> = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"".to_vec(), b"empty key".to_vec()),
            (b"key with spaces".to_vec(), vec![0u8, 255, 7]),
            (vec![0xde, 0xad], b"".to_vec()),
        ];

        let mut buf = Vec::new();
        for (k, v) in &records {
            write_record(&mut buf, k, v).unwrap();
        }

        let decoded: Vec<Record> =
            RecordReader::new(Cursor::new(buf)).collect::<io::Result<_>>().unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn sentinel_terminates_stream() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"k", b"v").unwrap();
        write_sentinel(&mut buf).unwrap();
        write_record(&mut buf, b"ignored", b"after sentinel").unwrap();

        let decoded: Vec<Record> =
            RecordReader::new(Cursor::new(buf)).collect::<io::Result<_>>().unwrap();
        assert_eq!(decoded, vec![(b"k".to_vec(), b"v".to_vec())]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key", b"value").unwrap();
        buf.truncate(buf.len() - 2);

        let results: Vec<_> = RecordReader::new(Cursor::new(buf)).collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn empty_stream_has_no_records() {
        let decoded: Vec<Record> =
            RecordReader::new(Cursor::new(Vec::new())).collect::<io::Result<_>>().unwrap();
        assert!(decoded.is_empty());
    }
}
