use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only event log backing one tenant's engine.
///
/// Record layout: little-endian `u32` payload length, bincode payload,
/// `u32` crc32 of the payload. Replay stops at the first record that is
/// short or fails its checksum, so a crash mid-append costs at most the
/// record being written.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

/// Serialize one event into its on-disk framing.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl Wal {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one event without flushing. The group-commit writer calls
    /// this for a whole batch, then `flush_sync` once.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.writer.write_all(&frame(event)?)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Drain the buffer and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Buffered append + flush in one step, for tests that don't batch.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Compaction phase one: write the replacement log to a sibling temp
    /// file and fsync it. The slow part, runs while appends continue.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            writer.write_all(&frame(event)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Compaction phase two: rename the temp file over the live log and
    /// reopen. Fast, runs on the writer task between batches.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases back to back.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record from disk. A missing file is an empty
    /// log; a torn or corrupt tail is dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Fill `buf` from the reader; `false` means the file ended first.
fn try_fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode one record, or `None` at EOF and on a torn or corrupt tail.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !try_fill(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    let mut crc_buf = [0u8; 4];
    if !try_fill(reader, &mut payload)? || !try_fill(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}
