// Segmented write-ahead log.
//
// Records are appended to a tail segment and assigned strictly increasing
// LSNs under the tail latch, so file order equals LSN order. A segment
// rotates once an append would push it past the configured size; rotated
// segments are immutable and may be archived (gzipped) or truncated away
// once the checkpoint floor passes them.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::common::{Lsn, TableId, TransactionId};
use crate::error::{DbError, Result};
use crate::wal::record::{ReadOutcome, WalPayload, WalRecord, WalRecordType};

struct WalTail {
    writer: BufWriter<File>,
    segment_index: u64,
    segment_bytes: u64,
    last_lsn: Lsn,
}

/// The write-ahead log: one active tail segment plus rotated history.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    /// Next LSN to assign. LSN 0 means "none".
    next_lsn: AtomicU64,
    /// Durable through this LSN.
    flushed_lsn: AtomicU64,
    /// Bytes appended since the last checkpoint, for the log-size trigger.
    bytes_since_checkpoint: AtomicU64,
    next_mtr_id: AtomicU64,
    tail: Mutex<WalTail>,
}

impl Wal {
    /// Opens the log directory, scanning existing segments to re-establish
    /// the LSN position. A torn final record is treated as tail truncation
    /// and trimmed; torn bytes anywhere else are corruption.
    pub fn open(dir: &Path, segment_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;

        let Some(((tail_index, tail_path), rotated)) = segments.split_last() else {
            return Self::finish_open(dir, segment_size, 1, 0, 0);
        };

        let mut last_lsn = 0;
        for (_, path) in rotated {
            let (segment_last, _, clean) = scan_segment(path)?;
            if !clean {
                return Err(DbError::Corrupted(format!(
                    "WAL segment {} has torn bytes before the tail",
                    path.display()
                )));
            }
            if let Some(lsn) = segment_last {
                last_lsn = lsn;
            }
        }

        let (segment_last, good_bytes, clean) = scan_segment(tail_path)?;
        if let Some(lsn) = segment_last {
            last_lsn = lsn;
        }
        if !clean {
            info!(segment = *tail_index, good_bytes, "trimming torn WAL tail");
            OpenOptions::new().write(true).open(tail_path)?.set_len(good_bytes)?;
        }
        Self::finish_open(dir, segment_size, *tail_index, last_lsn, good_bytes)
    }

    fn finish_open(
        dir: &Path,
        segment_size: u64,
        tail_index: u64,
        last_lsn: Lsn,
        tail_len: u64,
    ) -> Result<Self> {
        let path = segment_path(dir, tail_index);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(tail_len))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            next_lsn: AtomicU64::new(last_lsn + 1),
            flushed_lsn: AtomicU64::new(last_lsn),
            bytes_since_checkpoint: AtomicU64::new(0),
            next_mtr_id: AtomicU64::new(1),
            tail: Mutex::new(WalTail {
                writer: BufWriter::new(file),
                segment_index: tail_index,
                segment_bytes: tail_len,
                last_lsn,
            }),
        })
    }

    /// Appends one record and returns its LSN.
    pub fn append(
        &self,
        tx_id: TransactionId,
        table_id: TableId,
        record_type: WalRecordType,
        payload: WalPayload,
    ) -> Result<Lsn> {
        let mut tail = self.tail.lock();
        self.append_locked(&mut tail, tx_id, table_id, record_type, payload)
    }

    /// Appends a group of records with contiguous LSNs under one latch
    /// hold, returning the first and last LSN of the group.
    pub fn append_group(
        &self,
        records: Vec<(TransactionId, TableId, WalRecordType, WalPayload)>,
    ) -> Result<(Lsn, Lsn)> {
        if records.is_empty() {
            return Err(DbError::InvalidOperation(
                "empty WAL record group".into(),
            ));
        }
        let mut tail = self.tail.lock();
        let mut first = 0;
        let mut last = 0;
        for (tx_id, table_id, record_type, payload) in records {
            let lsn = self.append_locked(&mut tail, tx_id, table_id, record_type, payload)?;
            if first == 0 {
                first = lsn;
            }
            last = lsn;
        }
        Ok((first, last))
    }

    fn append_locked(
        &self,
        tail: &mut WalTail,
        tx_id: TransactionId,
        table_id: TableId,
        record_type: WalRecordType,
        payload: WalPayload,
    ) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord::new(lsn, tx_id, table_id, record_type, payload);
        let bytes = record.encode()?;

        if tail.segment_bytes > 0 && tail.segment_bytes + bytes.len() as u64 > self.segment_size {
            self.rotate_locked(tail)?;
        }
        tail.writer.write_all(&bytes)?;
        tail.segment_bytes += bytes.len() as u64;
        tail.last_lsn = lsn;
        self.bytes_since_checkpoint
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    fn rotate_locked(&self, tail: &mut WalTail) -> Result<()> {
        tail.writer.flush()?;
        tail.writer.get_ref().sync_all()?;
        let next_index = tail.segment_index + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, next_index))?;
        tail.writer = BufWriter::new(file);
        tail.segment_index = next_index;
        tail.segment_bytes = 0;
        debug!(segment = next_index, "rotated WAL segment");
        Ok(())
    }

    /// Makes the log durable through every appended record.
    pub fn flush(&self) -> Result<()> {
        let mut tail = self.tail.lock();
        tail.writer.flush()?;
        tail.writer.get_ref().sync_all()?;
        self.flushed_lsn.store(tail.last_lsn, Ordering::SeqCst);
        Ok(())
    }

    /// WAL rule: durably flushes through `lsn` before a page at that LSN
    /// may be written to its tablespace.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        if self.flushed_lsn.load(Ordering::SeqCst) >= lsn {
            return Ok(());
        }
        self.flush()
    }

    pub fn write_begin(&self, tx_id: TransactionId) -> Result<Lsn> {
        self.append(tx_id, 0, WalRecordType::Begin, WalPayload::None)
    }

    pub fn write_commit(&self, tx_id: TransactionId) -> Result<Lsn> {
        self.append(tx_id, 0, WalRecordType::Commit, WalPayload::None)
    }

    pub fn write_abort(&self, tx_id: TransactionId) -> Result<Lsn> {
        self.append(tx_id, 0, WalRecordType::Abort, WalPayload::None)
    }

    /// Rotates the tail segment regardless of its size.
    pub fn force_rotate(&self) -> Result<()> {
        let mut tail = self.tail.lock();
        if tail.segment_bytes > 0 {
            self.rotate_locked(&mut tail)?;
        }
        Ok(())
    }

    /// Last assigned LSN, 0 when the log is empty.
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst) - 1
    }

    /// Durable LSN floor.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.bytes_since_checkpoint.load(Ordering::Relaxed)
    }

    pub fn reset_bytes_since_checkpoint(&self) {
        self.bytes_since_checkpoint.store(0, Ordering::Relaxed);
    }

    /// Unique id for a mini-transaction.
    pub fn next_mini_tx_id(&self) -> u64 {
        self.next_mtr_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Iterates every record with `lsn >= from`, in LSN order. Buffered
    /// tail bytes are flushed first so the reader sees a consistent log.
    pub fn read_from(&self, from: Lsn) -> Result<WalReader> {
        self.flush()?;
        let segments = list_segments(&self.dir)?;
        Ok(WalReader {
            segments,
            position: 0,
            current: None,
            from,
            done: false,
        })
    }

    /// Immutable rotated segment paths, oldest first.
    pub fn get_rotated_files(&self) -> Result<Vec<PathBuf>> {
        let tail_index = self.tail.lock().segment_index;
        Ok(list_segments(&self.dir)?
            .into_iter()
            .filter(|(index, _)| *index != tail_index)
            .map(|(_, path)| path)
            .collect())
    }

    /// Gzips rotated segments into `<dir>/archive/` and removes the
    /// originals. Returns the archive paths.
    pub fn archive_rotated(&self) -> Result<Vec<PathBuf>> {
        let archive_dir = self.dir.join("archive");
        fs::create_dir_all(&archive_dir)?;
        let mut archived = Vec::new();
        for path in self.get_rotated_files()? {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("segment")
                .to_string();
            let target = archive_dir.join(format!("{name}.gz"));
            let mut input = File::open(&path)?;
            let mut encoder = GzEncoder::new(File::create(&target)?, Compression::default());
            std::io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.sync_all()?;
            fs::remove_file(&path)?;
            info!(segment = %name, archive = %target.display(), "archived WAL segment");
            archived.push(target);
        }
        Ok(archived)
    }

    /// Deletes rotated segments every record of which lies strictly below
    /// `floor`. The tail segment is never deleted.
    pub fn truncate_below(&self, floor: Lsn) -> Result<usize> {
        let mut removed = 0;
        for path in self.get_rotated_files()? {
            let (last, _, _) = scan_segment(&path)?;
            match last {
                Some(last) if last < floor => {
                    fs::remove_file(&path)?;
                    removed += 1;
                    debug!(segment = %path.display(), floor, "truncated WAL segment");
                }
                None => {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }
}

/// Iterator over WAL records across segment files.
pub struct WalReader {
    segments: Vec<(u64, PathBuf)>,
    position: usize,
    current: Option<BufReader<File>>,
    from: Lsn,
    done: bool,
}

impl WalReader {
    fn next_record(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.current.is_none() {
                let Some((_, path)) = self.segments.get(self.position) else {
                    self.done = true;
                    return Ok(None);
                };
                self.current = Some(BufReader::new(File::open(path)?));
            }

            let reader = self.current.as_mut().expect("segment reader open");
            match WalRecord::read_from(reader)? {
                ReadOutcome::Record(record) => {
                    if record.lsn >= self.from {
                        return Ok(Some(record));
                    }
                }
                ReadOutcome::Eof => {
                    self.current = None;
                    self.position += 1;
                }
                ReadOutcome::Truncated => {
                    let is_last = self.position + 1 == self.segments.len();
                    if is_last {
                        // Partial final record: the crash cut an append
                        // short. Everything before it is valid.
                        self.done = true;
                        return Ok(None);
                    }
                    let path = &self.segments[self.position].1;
                    return Err(DbError::Corrupted(format!(
                        "WAL segment {} has torn bytes before the tail",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Iterator for WalReader {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.log", index))
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = name
            .strip_prefix("wal-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Scans one segment: returns (last LSN seen, byte length of valid prefix,
/// whether the segment ended cleanly).
fn scan_segment(path: &Path) -> Result<(Option<Lsn>, u64, bool)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut last = None;
    let mut good_bytes = 0u64;
    loop {
        match WalRecord::read_from(&mut reader)? {
            ReadOutcome::Record(record) => {
                good_bytes += record.encoded_len()?;
                last = Some(record.lsn);
            }
            ReadOutcome::Eof => return Ok((last, good_bytes, true)),
            ReadOutcome::Truncated => return Ok((last, good_bytes, false)),
        }
    }
}
