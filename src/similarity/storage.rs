//! Binary storage for the vector index.
//!
//! File format: vectors.bin
//!
//! Header (50 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 of model name and preprocessing convention)
//! - metric: u8 (1 = l2, 2 = cosine)
//! - dimensions: u32 (little-endian)
//! - generation: u64 (little-endian), new on every rewrite of the file
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Records (repeated, replayed in order):
//! - kind: u8 (1 = upsert, 2 = remove)
//! - count: u32 (little-endian)
//! - body_len: u64 (little-endian)
//! - header_checksum: u32 (CRC32 of kind, count and body_len)
//! - body: `count` entries (upsert) or ids (remove)
//! - body_checksum: u32 (CRC32 of body)
//!
//! Upsert entry:
//! - id_len: u16, id: [u8; id_len] (UTF-8)
//! - path_len: u32, path: [u8; path_len] (UTF-8)
//! - name_len: u32, name: [u8; name_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Remove id:
//! - id_len: u16, id: [u8; id_len] (UTF-8)
//!
//! Each synced batch appends one record. Compaction rewrites the file as a
//! single upsert record under a fresh generation. A record cut short by the
//! end of the file is an interrupted append: it is ignored on read and
//! overwritten by the next append.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::similarity::index::{EntryMetadata, IndexEntry, Metric, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// version(1) + model_id(32) + metric(1) + dimensions(4) + generation(8) + checksum(4)
const HEADER_SIZE: usize = 50;

/// kind(1) + count(4) + body_len(8) + header_checksum(4)
const RECORD_HEADER_SIZE: usize = 17;

/// Record header plus the trailing body checksum
const RECORD_OVERHEAD: u64 = RECORD_HEADER_SIZE as u64 + 4;

const RECORD_UPSERT: u8 = 1;
const RECORD_REMOVE: u8 = 2;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: index was built with a different model or preprocessing")]
    ModelMismatch,

    #[error("Metric mismatch: index uses {found}, configured {expected}")]
    MetricMismatch { expected: Metric, found: Metric },

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Position in a particular version of the file.
///
/// `len` is the end of the last complete record read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub generation: u64,
    pub len: u64,
}

/// A change to append to the file.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    Upsert(&'a [IndexEntry]),
    Remove(&'a HashSet<String>),
}

enum DecodedRecord {
    Upsert(Vec<IndexEntry>),
    Remove(HashSet<String>),
}

/// Outcome of replaying records into an index.
#[derive(Debug, Clone, Copy)]
pub struct Replay {
    pub state: FileState,
    pub records: usize,
    /// Bytes after `state.len` that belong to an interrupted append
    pub torn_bytes: u64,
}

/// A fully loaded index file.
pub struct Loaded {
    pub index: VectorIndex,
    pub replay: Replay,
}

/// Storage manager for the persisted index file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Generation and length of the file on disk, reading only the header.
    pub fn state(&self) -> Result<Option<FileState>, VectorStorageError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        let header = read_header(&mut file)?;
        Ok(Some(FileState {
            generation: header.generation,
            len,
        }))
    }

    /// Load the index, checking it was written for the same model,
    /// dimensionality and metric.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
        expected_metric: Metric,
    ) -> Result<Loaded, VectorStorageError> {
        let mut file = File::open(&self.path)?;

        let header = read_header(&mut file)?;
        validate_header(&header, expected_model_id, expected_dimensions, expected_metric)?;

        let mut index = VectorIndex::new(header.dimensions as usize, header.metric);
        let start = FileState {
            generation: header.generation,
            len: HEADER_SIZE as u64,
        };
        let replay = self.replay_records(file, start, &mut index)?;

        Ok(Loaded { index, replay })
    }

    /// Apply the records appended after `from` to `index`.
    pub fn replay(
        &self,
        from: FileState,
        index: &mut VectorIndex,
    ) -> Result<Replay, VectorStorageError> {
        let mut file = File::open(&self.path)?;
        let header = read_header(&mut file)?;
        if header.generation != from.generation {
            return Err(VectorStorageError::InvalidFormat(
                "file was rewritten while replaying".to_string(),
            ));
        }
        self.replay_records(file, from, index)
    }

    /// Rewrite the whole index as a single record under a new generation.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<FileState, VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");
        let generation = new_generation();

        let len = match write_to_file(&temp_path, index, model_id, generation) {
            Ok(len) => len,
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(err);
            }
        };

        std::fs::rename(&temp_path, &self.path)?;

        Ok(FileState { generation, len })
    }

    /// Append a record after the last complete one in `at`.
    ///
    /// The caller must hold the index lock and have caught up with the file,
    /// so `at` describes its current generation.
    pub fn append(&self, at: FileState, record: Record<'_>) -> Result<FileState, VectorStorageError> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        // drops any interrupted append past the last good record
        file.set_len(at.len)?;
        file.seek(SeekFrom::Start(at.len))?;

        let mut writer = BufWriter::new(file);
        let written = write_record(&mut writer, record)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;

        Ok(FileState {
            generation: at.generation,
            len: at.len + written,
        })
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn replay_records(
        &self,
        mut file: File,
        from: FileState,
        index: &mut VectorIndex,
    ) -> Result<Replay, VectorStorageError> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(from.len))?;
        let mut reader = BufReader::new(file);

        let mut offset = from.len;
        let mut records = 0;
        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < RECORD_HEADER_SIZE as u64 {
                break;
            }

            let (kind, count, body_len) = read_record_header(&mut reader)?;
            if remaining < RECORD_OVERHEAD || body_len > remaining - RECORD_OVERHEAD {
                break;
            }

            let mut limited = (&mut reader).take(body_len);
            let mut body = ChecksumReader::new(&mut limited);
            let record = read_record(&mut body, kind, count, index.dimensions())?;
            let computed = body.finalize();
            if limited.limit() != 0 {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "record at offset {offset} has {} trailing bytes",
                    limited.limit()
                )));
            }

            let mut trailer = [0u8; 4];
            reader.read_exact(&mut trailer)?;
            if u32::from_le_bytes(trailer) != computed {
                return Err(VectorStorageError::ChecksumMismatch);
            }

            match record {
                DecodedRecord::Upsert(entries) => {
                    index.upsert(entries).map_err(|e| {
                        VectorStorageError::InvalidFormat(format!("stored entry rejected: {e}"))
                    })?;
                }
                DecodedRecord::Remove(ids) => {
                    index.remove(&ids);
                }
            }

            offset += RECORD_OVERHEAD + body_len;
            records += 1;
        }

        let torn_bytes = file_len - offset;
        if torn_bytes > 0 {
            log::warn!(
                "ignoring {torn_bytes} bytes of an interrupted write at the end of {}",
                self.path.display()
            );
        }

        Ok(Replay {
            state: FileState {
                generation: from.generation,
                len: offset,
            },
            records,
            torn_bytes,
        })
    }
}

fn new_generation() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ (u64::from(std::process::id()) << 40)
}

fn write_to_file(
    path: &Path,
    index: &VectorIndex,
    model_id: &[u8; 32],
    generation: u64,
) -> Result<u64, VectorStorageError> {
    let dimensions = u32::try_from(index.dimensions()).map_err(|_| {
        VectorStorageError::InvalidFormat(format!("{} dimensions do not fit", index.dimensions()))
    })?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let header = Header {
        version: FORMAT_VERSION,
        model_id: *model_id,
        metric: index.metric(),
        dimensions,
        generation,
    };
    write_header(&mut writer, &header)?;

    let mut len = HEADER_SIZE as u64;
    if !index.is_empty() {
        len += write_record(&mut writer, Record::Upsert(index.entries()))?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(len)
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    metric: Metric,
    dimensions: u32,
    generation: u64,
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    // Checksum before interpreting any other field
    if le_u32(&bytes[46..50]) != crc32fast::hash(&bytes[0..46]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);

    let metric = Metric::from_byte(bytes[33]).ok_or_else(|| {
        VectorStorageError::InvalidFormat(format!("unknown metric tag {}", bytes[33]))
    })?;

    Ok(Header {
        version,
        model_id,
        metric,
        dimensions: le_u32(&bytes[34..38]),
        generation: le_u64(&bytes[38..46]),
    })
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
    expected_metric: Metric,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    if header.metric != expected_metric {
        return Err(VectorStorageError::MetricMismatch {
            expected: expected_metric,
            found: header.metric,
        });
    }

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];

    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33] = header.metric.to_byte();
    bytes[34..38].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[38..46].copy_from_slice(&header.generation.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..46]);
    bytes[46..50].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_record_header(reader: &mut impl Read) -> Result<(u8, u32, u64), VectorStorageError> {
    let mut bytes = [0u8; RECORD_HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    if le_u32(&bytes[13..17]) != crc32fast::hash(&bytes[0..13]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    Ok((bytes[0], le_u32(&bytes[1..5]), le_u64(&bytes[5..13])))
}

/// Write one framed record, returning the number of bytes written.
fn write_record(writer: &mut impl Write, record: Record<'_>) -> Result<u64, VectorStorageError> {
    // Sized up front so nothing is written for a record that cannot be encoded
    let (kind, count, body_len) = match record {
        Record::Upsert(entries) => {
            let mut len = 0u64;
            for entry in entries {
                len += id_len(&entry.id)?
                    + 8
                    + entry.metadata.path.len() as u64
                    + entry.metadata.name.len() as u64
                    + 4 * entry.vector.len() as u64;
            }
            (RECORD_UPSERT, entries.len(), len)
        }
        Record::Remove(ids) => {
            let mut len = 0u64;
            for id in ids {
                len += id_len(id)?;
            }
            (RECORD_REMOVE, ids.len(), len)
        }
    };
    let count = u32::try_from(count).map_err(|_| {
        VectorStorageError::InvalidFormat(format!("{count} items do not fit in one record"))
    })?;

    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[0] = kind;
    header[1..5].copy_from_slice(&count.to_le_bytes());
    header[5..13].copy_from_slice(&body_len.to_le_bytes());
    let checksum = crc32fast::hash(&header[0..13]);
    header[13..17].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;

    let mut body = ChecksumWriter::new(&mut *writer);
    match record {
        Record::Upsert(entries) => {
            for entry in entries {
                write_entry(&mut body, entry)?;
            }
        }
        Record::Remove(ids) => {
            for id in ids {
                write_id(&mut body, id)?;
            }
        }
    }
    let body_checksum = body.finalize();
    writer.write_all(&body_checksum.to_le_bytes())?;

    Ok(RECORD_OVERHEAD + body_len)
}

fn read_record(
    reader: &mut impl Read,
    kind: u8,
    count: u32,
    dimensions: usize,
) -> Result<DecodedRecord, VectorStorageError> {
    match kind {
        RECORD_UPSERT => (0..count)
            .map(|_| read_entry(reader, dimensions))
            .collect::<Result<Vec<_>, _>>()
            .map(DecodedRecord::Upsert),
        RECORD_REMOVE => (0..count)
            .map(|_| read_id(reader))
            .collect::<Result<HashSet<_>, _>>()
            .map(DecodedRecord::Remove),
        other => Err(VectorStorageError::InvalidFormat(format!(
            "unknown record kind {other}"
        ))),
    }
}

/// Encoded size of an id including its length prefix.
fn id_len(id: &str) -> Result<u64, VectorStorageError> {
    u16::try_from(id.len())
        .map(|len| 2 + u64::from(len))
        .map_err(|_| VectorStorageError::InvalidFormat(format!("id too long: {id}")))
}

fn read_id(reader: &mut impl Read) -> Result<String, VectorStorageError> {
    let mut len16 = [0u8; 2];
    reader.read_exact(&mut len16)?;
    read_string(reader, u16::from_le_bytes(len16) as usize)
}

fn write_id(writer: &mut impl Write, id: &str) -> Result<(), VectorStorageError> {
    let len = u16::try_from(id.len())
        .map_err(|_| VectorStorageError::InvalidFormat(format!("id too long: {id}")))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(id.as_bytes())?;
    Ok(())
}

fn read_entry(reader: &mut impl Read, dimensions: usize) -> Result<IndexEntry, VectorStorageError> {
    let id = read_id(reader)?;
    let path = read_prefixed_string(reader)?;
    let name = read_prefixed_string(reader)?;

    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        vector.push(f32::from_le_bytes(float_bytes));
    }

    Ok(IndexEntry {
        id,
        vector,
        metadata: EntryMetadata { path, name },
    })
}

fn write_entry(writer: &mut impl Write, entry: &IndexEntry) -> Result<(), VectorStorageError> {
    write_id(writer, &entry.id)?;
    write_prefixed_string(writer, &entry.metadata.path)?;
    write_prefixed_string(writer, &entry.metadata.name)?;

    for &value in &entry.vector {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

fn read_prefixed_string(reader: &mut impl Read) -> Result<String, VectorStorageError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    read_string(reader, u32::from_le_bytes(len) as usize)
}

fn read_string(reader: &mut impl Read, len: usize) -> Result<String, VectorStorageError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| VectorStorageError::InvalidFormat(format!("invalid UTF-8 string: {e}")))
}

fn write_prefixed_string(writer: &mut impl Write, value: &str) -> Result<(), VectorStorageError> {
    let len = u32::try_from(value.len())
        .map_err(|_| VectorStorageError::InvalidFormat("string too long".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Reader that feeds every byte it yields into a CRC32 hasher.
struct ChecksumReader<'a, R: Read> {
    inner: &'a mut R,
    hasher: crc32fast::Hasher,
}

impl<'a, R: Read> ChecksumReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for ChecksumReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer counterpart of [`ChecksumReader`].
struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: crc32fast::Hasher,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<W: Write> Write for ChecksumWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
