//! The index file writer contract (spec §6, "External interfaces").
//!
//! The on-disk trace *payload* is opaque to the core and never touched
//! here. The core does own the *index* file: a sequence of fixed-size,
//! big-endian records, one per packet, appended in the order
//! `relay_index_try_flush` releases them. `IndexFileWriter` is the seam a
//! real file-backed implementation and a test double both sit behind.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The nine big-endian u64 fields written for one packet (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRecord {
    pub packet_size: u64,
    pub content_size: u64,
    pub timestamp_begin: u64,
    pub timestamp_end: u64,
    pub events_discarded: u64,
    pub stream_id: u64,
    pub stream_instance_id: u64,
    pub packet_seq_num: u64,
    pub offset: u64,
}

impl IndexRecord {
    pub const ENCODED_LEN: usize = 9 * 8;

    pub fn to_be_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let fields = [
            self.packet_size,
            self.content_size,
            self.timestamp_begin,
            self.timestamp_end,
            self.events_discarded,
            self.stream_id,
            self.stream_instance_id,
            self.packet_seq_num,
            self.offset,
        ];
        for (i, field) in fields.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&field.to_be_bytes());
        }
        buf
    }
}

pub trait IndexFileWriter: Send + Sync {
    fn write_record(&self, record: &IndexRecord) -> io::Result<()>;
}

struct IndexFileInner {
    writer: Box<dyn IndexFileWriter>,
}

/// A refcounted handle to an index file. Cheap to clone; every clone
/// writes through to the same underlying writer.
#[derive(Clone)]
pub struct IndexFile(Arc<IndexFileInner>);

impl IndexFile {
    pub fn new(writer: impl IndexFileWriter + 'static) -> Self {
        Self(Arc::new(IndexFileInner {
            writer: Box::new(writer),
        }))
    }

    /// Named to match the spec's get/put vocabulary for external handles;
    /// backed by `Clone`.
    pub fn get(&self) -> Self {
        self.clone()
    }

    /// Release this handle. A no-op beyond `Drop`.
    pub fn put(self) {}

    pub fn write_record(&self, record: &IndexRecord) -> io::Result<()> {
        self.0.writer.write_record(record)
    }
}

/// A real, append-only file-backed index writer.
pub struct FileIndexWriter {
    file: Mutex<File>,
}

impl FileIndexWriter {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl IndexFileWriter for FileIndexWriter {
    fn write_record(&self, record: &IndexRecord) -> io::Result<()> {
        let mut file = self.file.lock().expect("index file lock poisoned");
        file.write_all(&record.to_be_bytes())?;
        file.flush()
    }
}

/// An in-memory writer for unit and integration tests: records the raw
/// bytes of every write in arrival order, exactly as they'd land on disk.
#[derive(Default)]
pub struct MemoryIndexWriter {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryIndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().expect("index file lock poisoned").clone()
    }

    pub fn record_count(&self) -> usize {
        self.contents().len() / IndexRecord::ENCODED_LEN
    }
}

impl IndexFileWriter for MemoryIndexWriter {
    fn write_record(&self, record: &IndexRecord) -> io::Result<()> {
        self.bytes
            .lock()
            .expect("index file lock poisoned")
            .extend_from_slice(&record.to_be_bytes());
        Ok(())
    }
}

impl IndexFileWriter for Arc<MemoryIndexWriter> {
    fn write_record(&self, record: &IndexRecord) -> io::Result<()> {
        MemoryIndexWriter::write_record(self, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encodes_fields_in_order_big_endian() {
        let record = IndexRecord {
            packet_size: 100,
            content_size: 90,
            timestamp_begin: 1,
            timestamp_end: 2,
            events_discarded: 0,
            stream_id: 5,
            stream_instance_id: 11,
            packet_seq_num: 3,
            offset: 4096,
        };
        let mut expected = Vec::new();
        for field in [100u64, 90, 1, 2, 0, 5, 11, 3, 4096] {
            expected.extend_from_slice(&field.to_be_bytes());
        }
        assert_eq!(record.to_be_bytes().to_vec(), expected);
    }

    #[test]
    fn memory_writer_accumulates_records_in_order() {
        let writer = Arc::new(MemoryIndexWriter::new());
        let file = IndexFile::new(writer.clone());
        file.write_record(&IndexRecord {
            stream_id: 1,
            ..Default::default()
        })
        .unwrap();

        // Re-derive a handle to the same writer via clone to confirm
        // writes-through-any-clone semantics.
        let clone = file.get();
        clone
            .write_record(&IndexRecord {
                stream_id: 2,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(writer.record_count(), 2);
    }
}
