use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::error::{BatchdError, Result};
use crate::protocol::{decode_message, encode_frame, Message};

const JOURNAL_FILE: &str = "journal.dat";
const SNAPSHOT_FILE: &str = "snapshot.dat";
const SNAPSHOT_TMP: &str = "snapshot.tmp";

/// Append-and-flush durable record store.
///
/// Every committed mutation is appended as one codec frame before the
/// operation is acknowledged. `dirty` tracks unflushed bytes; `flush` fsyncs
/// and clears it. A snapshot folds the full state into `snapshot.dat`
/// (write-tmp, fsync, rename) and truncates the journal.
pub struct Journal {
    dir: PathBuf,
    file: File,
    dirty: bool,
}

impl Journal {
    /// Open (creating if needed) the journal under `dir`. Call `replay`
    /// first when recovering; this is the write handle.
    pub fn open(dir: &Path) -> Result<Journal> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(JOURNAL_FILE))?;
        Ok(Journal {
            dir: dir.to_path_buf(),
            file,
            dirty: false,
        })
    }

    /// Append one record. The operation is not committed until a flush.
    pub fn append(&mut self, record: &Message) -> Result<()> {
        self.file.write_all(&encode_frame(record))?;
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Fsync the journal and clear the dirty flag. Blocks the event loop, so
    /// the cost is measured and logged.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let start = Instant::now();
        self.file.sync_data()?;
        self.dirty = false;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "journal flush");
        Ok(())
    }

    /// Write a full-state snapshot and truncate the journal.
    ///
    /// The snapshot lands in a temporary file, is fsynced, then renamed over
    /// `snapshot.dat`, so a crash mid-save leaves the previous snapshot and
    /// the untruncated journal intact.
    pub fn write_snapshot<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Message>,
    {
        let start = Instant::now();
        let tmp_path = self.dir.join(SNAPSHOT_TMP);

        let mut tmp = File::create(&tmp_path)?;
        let mut count = 0usize;
        for record in records {
            tmp.write_all(&encode_frame(&record))?;
            count += 1;
        }
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE))?;

        // Journal records are folded into the snapshot now.
        self.file.sync_data()?;
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.dirty = false;

        info!(
            records = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "state snapshot written"
        );
        Ok(())
    }

    /// Recover durable state: snapshot records first, then the journal tail,
    /// in order. A torn trailing journal record (appended but never flushed
    /// before a crash) is dropped; the torn bytes are truncated away so later
    /// appends start from a clean frame boundary.
    pub fn replay(dir: &Path) -> Result<Vec<Message>> {
        let mut records = Vec::new();

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let mut buf = read_file(&snapshot_path)?;
            while let Some(record) = decode_message(&mut buf)? {
                records.push(record);
            }
            if !buf.is_empty() {
                // Snapshots are renamed into place whole; a partial one
                // means real corruption, not a mid-append crash.
                return Err(BatchdError::Journal(format!(
                    "snapshot has {} trailing bytes",
                    buf.len()
                )));
            }
            info!(records = records.len(), "snapshot loaded");
        }

        let journal_path = dir.join(JOURNAL_FILE);
        if journal_path.exists() {
            let mut buf = read_file(&journal_path)?;
            let total = buf.len() as u64;
            let snapshot_count = records.len();
            loop {
                match decode_message(&mut buf) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => break,
                    Err(e) => {
                        // Mid-frame corruption is indistinguishable from a
                        // torn append only at the very tail.
                        return Err(BatchdError::Journal(format!("journal replay failed: {e}")));
                    }
                }
            }
            if !buf.is_empty() {
                let valid = total - buf.len() as u64;
                warn!(
                    torn_bytes = buf.len(),
                    "dropping unflushed journal tail"
                );
                let file = OpenOptions::new().write(true).open(&journal_path)?;
                file.set_len(valid)?;
                file.sync_data()?;
            }
            info!(
                records = records.len() - snapshot_count,
                "journal replayed"
            );
        }

        Ok(records)
    }
}

fn read_file(path: &Path) -> Result<BytesMut> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    Ok(BytesMut::from(&raw[..]))
}
