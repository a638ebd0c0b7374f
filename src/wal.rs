use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back from disk.
#[derive(Debug)]
pub struct Replay<R> {
    pub records: Vec<R>,
    /// Byte length of the valid prefix. Anything past it is a torn or corrupt tail.
    pub valid_len: u64,
    pub discarded_bytes: u64,
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: record][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) fails the length or CRC check and is dropped;
///   `open_truncated` cuts it off so later appends are not hidden behind it.
/// - A batch is all-or-nothing: a failed batch is cut back to `committed_len`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Length of the durable prefix, as of the last successful sync.
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            appends_since_compact: 0,
        })
    }

    /// Truncate the file to `valid_len` and open it for appending.
    pub fn open_truncated(path: &Path, valid_len: u64) -> io::Result<Self> {
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Self::open(path)
    }

    /// Append one record and fsync.
    #[cfg(test)]
    pub fn append<R: Serialize>(&mut self, record: &R) -> io::Result<()> {
        self.append_batch([record])
    }

    /// Append every record with a single fsync. Either the whole batch is
    /// durable, or the file is restored to its length before the call.
    pub fn append_batch<'a, R: Serialize + 'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a R>,
    ) -> io::Result<()> {
        // Encode up front: a record that fails to serialize never reaches the file.
        let mut buf = Vec::new();
        let mut count = 0u64;
        for record in records {
            encode_record(&mut buf, record)?;
            count += 1;
        }

        let written = self
            .writer
            .write_all(&buf)
            .and_then(|()| self.writer.flush())
            .and_then(|()| self.writer.get_ref().sync_all());
        if let Err(e) = written {
            return match self.rollback() {
                Ok(()) => Err(e),
                Err(rollback) => Err(io::Error::new(
                    e.kind(),
                    format!("{e} (rollback failed: {rollback})"),
                )),
            };
        }

        self.committed_len += buf.len() as u64;
        self.appends_since_compact += count;
        Ok(())
    }

    /// Discard unflushed bytes and cut the file back to the durable prefix.
    fn rollback(&mut self) -> io::Result<()> {
        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(reopened));
        // into_parts drops the buffer instead of writing it out on drop.
        let (file, _unflushed) = stale.into_parts();
        file.set_len(self.committed_len)?;
        file.sync_all()
    }

    #[cfg(test)]
    fn len_on_disk(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file next to `path` and fsync it.
    pub fn write_compact_file<R: Serialize>(path: &Path, records: &[R]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact<R: Serialize>(&mut self, records: &[R]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every valid record. Reading stops at the first truncated or corrupt entry.
    pub fn replay<R: DeserializeOwned>(path: &Path) -> io::Result<Replay<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    records: Vec::new(),
                    valid_len: 0,
                    discarded_bytes: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if valid_len + 8 + len > total_len {
                break; // length prefix points past EOF
            }

            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<R>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += 8 + len;
        }

        Ok(Replay {
            records,
            valid_len,
            discarded_bytes: total_len - valid_len,
        })
    }
}
