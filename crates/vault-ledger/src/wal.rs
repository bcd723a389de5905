use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vault_types::{BlobRecord, Digest};

use crate::error::{LedgerError, LedgerResult};
use crate::memory::Journal;

/// One journaled ledger change.
///
/// Each event carries the complete row state after the change, so replay is
/// last-writer-wins per digest and needs no arithmetic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// The row for this digest now has exactly this content.
    Upsert(BlobRecord),
    /// The row for this digest was reclaimed.
    Remove(Digest),
}

impl LedgerEvent {
    pub fn digest(&self) -> &Digest {
        match self {
            Self::Upsert(record) => &record.digest,
            Self::Remove(digest) => digest,
        }
    }
}

/// Flush/sync strategy for the WAL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every write (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for the ledger write-ahead log.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalConfig {
    pub sync_mode: SyncMode,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Destination of WAL frames. Writes are unbuffered.
pub(crate) trait LogFile: Write + Send {
    /// Cut the file back to `len` bytes.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

struct WalWriter {
    file: Box<dyn LogFile>,
    /// End of the last complete frame.
    offset: u64,
    /// Set when a failed append could not be rolled back. The tail of the
    /// file is then unknown and every later append is refused.
    broken: bool,
}

impl WalWriter {
    fn write_frame(&mut self, frame: &[u8], sync_mode: SyncMode) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        if sync_mode == SyncMode::EveryWrite {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Drop whatever part of a failed frame reached the file.
    fn roll_back(&mut self) {
        if let Err(e) = self.file.truncate_to(self.offset) {
            warn!(offset = self.offset, error = %e, "WAL rollback failed; refusing further appends");
            self.broken = true;
        }
    }
}

/// Crash-recoverable write-ahead log of ledger changes.
///
/// On-disk format, repeated per entry:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized LedgerEvent)]
/// ```
///
/// On open the file is read front-to-back. The first entry that is torn,
/// fails its CRC, or does not decode ends recovery; everything from there on
/// is truncated away so later appends start on a clean boundary. A failed
/// append is rolled back the same way before the error is returned.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    config: WalConfig,
}

impl WriteAheadLog {
    /// Open (or create) the log at `path`, returning it together with every
    /// recovered event in append order.
    pub fn open(path: &Path, config: WalConfig) -> LedgerResult<(Self, Vec<LedgerEvent>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (events, valid_len) = recover(path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating unreadable WAL tail"
            );
            file.set_len(valid_len)?;
        }

        let wal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: Box::new(file),
                offset: valid_len,
                broken: false,
            }),
            config,
        };
        Ok((wal, events))
    }

    /// Append a single event. Returns the byte offset of the entry.
    pub fn append(&self, event: &LedgerEvent) -> LedgerResult<u64> {
        let frame = encode_frame(event)?;

        let mut w = self.lock_writer()?;
        if w.broken {
            return Err(LedgerError::Io(io::Error::other(
                "WAL tail is unknown after a failed rollback",
            )));
        }
        let entry_offset = w.offset;
        if let Err(e) = w.write_frame(&frame, self.config.sync_mode) {
            w.roll_back();
            return Err(e.into());
        }
        w.offset += frame.len() as u64;

        debug!(offset = entry_offset, len = frame.len(), digest = %event.digest(), "WAL append");
        Ok(entry_offset)
    }

    /// Replace the whole log with `events`.
    ///
    /// The new log is written to a temporary file in the same directory,
    /// synced, and renamed over the old one, so a crash leaves either the
    /// old log or the new one, never a mix.
    pub fn rewrite<'a>(&self, events: impl IntoIterator<Item = &'a LedgerEvent>) -> LedgerResult<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut w = self.lock_writer()?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".ledger-compact-")
            .tempfile_in(&dir)?;
        let mut written = 0u64;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            for event in events {
                let frame = encode_frame(event)?;
                out.write_all(&frame)?;
                written += frame.len() as u64;
            }
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| LedgerError::Io(e.error))?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.file = Box::new(file);
        w.offset = written;
        w.broken = false;

        debug!(path = %self.path.display(), bytes = written, "WAL rewritten");
        Ok(())
    }

    /// Current write offset (log length in bytes).
    pub fn offset(&self) -> u64 {
        self.writer.lock().map(|w| w.offset).unwrap_or_default()
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn replace_file(&self, file: Box<dyn LogFile>) {
        if let Ok(mut w) = self.writer.lock() {
            w.file = file;
        }
    }

    fn lock_writer(&self) -> LedgerResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| LedgerError::LockPoisoned)
    }
}

impl Journal for WriteAheadLog {
    fn append(&self, event: &LedgerEvent) -> LedgerResult<()> {
        WriteAheadLog::append(self, event).map(|_| ())
    }
}

fn encode_frame(event: &LedgerEvent) -> LedgerResult<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| LedgerError::Serialization("WAL entry exceeds 4 GiB".into()))?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read every valid event and the length of the valid prefix of the file.
fn recover(path: &Path) -> LedgerResult<(Vec<LedgerEvent>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut events = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header_buf = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]]);
        let expected_crc = u32::from_le_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);

        if length == 0 || (offset + HEADER_SIZE as u64 + length as u64) > file_len {
            warn!(offset, length, file_len, "invalid WAL entry length; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated WAL entry; stopping recovery");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let entry_end = offset + HEADER_SIZE as u64 + length as u64;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; stopping recovery"
            );
            break;
        }

        match bincode::deserialize::<LedgerEvent>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(offset, error = %e, "undecodable WAL entry; stopping recovery");
                break;
            }
        }
        offset = entry_end;
    }

    debug!(recovered = events.len(), valid_len = offset, "WAL recovery complete");
    Ok((events, offset))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::LogFile;

    /// Log file whose next write, once armed, lands half a frame on disk and
    /// then fails as a full disk would.
    pub(crate) struct FailingFile {
        file: File,
        armed: Arc<AtomicBool>,
    }

    impl FailingFile {
        pub(crate) fn open(path: &Path) -> (Self, Arc<AtomicBool>) {
            let file = OpenOptions::new().append(true).open(path).unwrap();
            let armed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    file,
                    armed: armed.clone(),
                },
                armed,
            )
        }
    }

    impl Write for FailingFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.file.write_all(&buf[..buf.len() / 2])?;
                return Err(io::Error::other("no space left on device"));
            }
            self.file.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl LogFile for FailingFile {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }

        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }
    }
}
