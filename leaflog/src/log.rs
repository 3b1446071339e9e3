/*
 * This file is a part of leaflog.
 *
 * leaflog is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * leaflog is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with leaflog. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The append-only log: a single file holding a fixed identifier, a
//! mutable current-root pointer and a sequence of immutable,
//! text-framed records.
//!
//! ```text
//! <IDENT>\n
//! <DECIMAL-ROOT>\n
//! \t<record-bytes>\n
//! \t<record-bytes>\n
//! ...
//! ```
//!
//! This module knows nothing about what a record *means* — that's
//! `crate::record`'s job. It only guarantees: once stored, a record's
//! bytes never change (I1), and the root pointer only ever advances
//! via compare-and-swap (I7).

use crate::error::{LogError, LogResult};
use crate::flock;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// The fixed 36-byte identifier that opens every leaflog file.
pub const IDENTIFIER: &[u8] = b"3dbf4cbc-f015-43d9-b280-ff6962a22198";
/// Width (in digits) used for the root pointer when a new file is created.
pub const DEFAULT_HEADER_WIDTH: usize = 15;
/// The widest root-pointer field this implementation will accept.
pub const MAX_HEADER_WIDTH: usize = 15;

enum Backend {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

impl Backend {
    fn fsync(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.sync_all(),
            Self::Memory(_) => Ok(()),
        }
    }
}

impl Read for Backend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.read(buf),
            Self::Memory(c) => c.read(buf),
        }
    }
}

impl Write for Backend {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::Memory(c) => c.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::Memory(c) => c.flush(),
        }
    }
}

impl Seek for Backend {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::File(f) => f.seek(pos),
            Self::Memory(c) => c.seek(pos),
        }
    }
}

/// A handle on the single-file append log.
///
/// Cheap to share via `&Log` (all mutation goes through an internal
/// [`parking_lot::Mutex`]); not `Clone` — a second independent view
/// onto the same path is obtained by calling [`Log::open`] again.
pub struct Log {
    backend: Mutex<Backend>,
    lockable: bool,
    /// In-process reentrancy guard (I7 / the spec's non-reentrant
    /// locking requirement). Tracked even for the in-memory backend,
    /// whose OS-level lock is a no-op.
    locked: AtomicBool,
    header_width: Mutex<Option<usize>>,
}

/// RAII guard releasing the advisory lock (both the OS-level
/// byte-range lock, when applicable, and the in-process reentrancy
/// flag) on drop.
struct LockGuard<'a> {
    log: &'a Log,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if self.log.lockable {
            let backend = self.log.backend.lock();
            if let Backend::File(f) = &*backend {
                let _ = flock::unlock(f);
            }
        }
        let was_locked = self.log.locked.swap(false, Ordering::Release);
        debug_assert!(was_locked, "unlocking a log that wasn't locked");
    }
}

impl Log {
    fn acquire(&self, exclusive: bool) -> LogResult<LockGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(LogError::Storage("nested lock acquisition".to_owned()));
        }
        if self.lockable {
            let backend = self.backend.lock();
            if let Backend::File(f) = &*backend {
                let result = if exclusive {
                    flock::lock_exclusive(f)
                } else {
                    flock::lock_shared(f)
                };
                if let Err(e) = result {
                    self.locked.store(false, Ordering::Release);
                    return Err(LogError::Io(e));
                }
            }
        }
        Ok(LockGuard { log: self })
    }

    /// Create (truncating if present) a fresh, empty log at `path`.
    pub fn create(path: impl AsRef<Path>) -> LogResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::init(&mut file)?;
        Ok(())
    }

    fn init(w: &mut (impl Write + Seek)) -> LogResult<()> {
        w.seek(SeekFrom::Start(0))?;
        let mut line = Vec::with_capacity(IDENTIFIER.len() + DEFAULT_HEADER_WIDTH + 2);
        line.extend_from_slice(IDENTIFIER);
        line.push(b'\n');
        line.extend(std::iter::repeat(b'0').take(DEFAULT_HEADER_WIDTH));
        line.push(b'\n');
        w.write_all(&line)?;
        Ok(())
    }

    /// Open an existing log, or create one first if `create_if_missing`
    /// is set. `reset_if_exists` unlinks and recreates the file even if
    /// it already exists — handy for tests that want a guaranteed-fresh
    /// file at a fixed path.
    pub fn open(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        reset_if_exists: bool,
    ) -> LogResult<Self> {
        let path = path.as_ref();
        if reset_if_exists {
            let _ = std::fs::remove_file(path);
            Self::create(path)?;
        } else if create_if_missing && !path.exists() {
            Self::create(path)?;
        }
        // opened without std's internal buffering: every read/write goes
        // straight to the OS so writes from other processes are visible
        // immediately, per the I/O discipline in the spec.
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            backend: Mutex::new(Backend::File(file)),
            lockable: true,
            locked: AtomicBool::new(false),
            header_width: Mutex::new(None),
        })
    }

    /// An in-memory log, for tests. Locking is tracked but is a no-op.
    pub fn open_in_memory() -> LogResult<Self> {
        let mut buf = Cursor::new(Vec::new());
        Self::init(&mut buf)?;
        Ok(Self {
            backend: Mutex::new(Backend::Memory(buf)),
            lockable: false,
            locked: AtomicBool::new(false),
            header_width: Mutex::new(None),
        })
    }

    fn read_line_at(backend: &mut Backend, offset: u64) -> LogResult<Vec<u8>> {
        backend.seek(SeekFrom::Start(offset))?;
        Self::read_line(backend)
    }

    fn read_line(backend: &mut Backend) -> LogResult<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match backend.read(&mut byte)? {
                0 => {
                    if line.is_empty() {
                        return Err(LogError::CorruptedFormat("unexpected end of file".into()));
                    }
                    return Err(LogError::CorruptedFormat("unterminated line".into()));
                }
                _ => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                }
            }
        }
    }

    fn parse_root_line(line: &[u8]) -> LogResult<(u64, usize)> {
        if line.len() < 2 || line.len() - 1 > MAX_HEADER_WIDTH || line.last() != Some(&b'\n') {
            return Err(LogError::CorruptedFormat(format!(
                "invalid root-pointer line ({line:?})"
            )));
        }
        let digits = &line[..line.len() - 1];
        if !digits.iter().all(|b| b.is_ascii_digit()) {
            return Err(LogError::CorruptedFormat(format!(
                "root pointer is not numeric ({line:?})"
            )));
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| LogError::CorruptedFormat("root pointer is not UTF-8".into()))?;
        let value: u64 = text
            .parse()
            .map_err(|_| LogError::CorruptedFormat("root pointer overflow".into()))?;
        Ok((value, digits.len()))
    }

    fn check_identifier(line: &[u8]) -> LogResult<()> {
        if line != [IDENTIFIER, b"\n"].concat() {
            return Err(LogError::CorruptedFormat(
                "identifier line not recognized".into(),
            ));
        }
        Ok(())
    }

    /// Read the current root offset. `0` means "no root".
    pub fn get_current(&self) -> LogResult<u64> {
        let _guard = self.acquire(false)?;
        let mut backend = self.backend.lock();
        let ident = Self::read_line_at(&mut backend, 0)?;
        Self::check_identifier(&ident)?;
        let root_line = Self::read_line(&mut backend)?;
        let (value, width) = Self::parse_root_line(&root_line)?;
        *self.header_width.lock() = Some(width);
        Ok(value)
    }

    /// Advance the root pointer to `new`. If `expected` is `Some`, the
    /// write only happens if the on-disk root still equals it
    /// (compare-and-swap); otherwise raises [`LogError::Concurrency`].
    pub fn set_current(&self, new: u64, expected: Option<u64>) -> LogResult<()> {
        let _guard = self.acquire(true)?;
        let mut backend = self.backend.lock();
        let ident = Self::read_line_at(&mut backend, 0)?;
        Self::check_identifier(&ident)?;
        let root_pos = ident.len() as u64;
        let root_line = Self::read_line(&mut backend)?;
        let (observed, width) = Self::parse_root_line(&root_line)?;
        *self.header_width.lock() = Some(width);
        if let Some(expected) = expected {
            if observed != expected {
                return Err(LogError::Concurrency { expected, observed });
            }
        }
        let encoded = format!("{new:0width$}\n", width = width);
        debug_assert_eq!(encoded.len(), root_line.len(), "root-line width must be stable");
        backend.seek(SeekFrom::Start(root_pos))?;
        backend.write_all(encoded.as_bytes())?;
        backend.fsync()?;
        Ok(())
    }

    /// Append `record` and return its offset (the byte position of its
    /// leading `\t`). `record` must not contain `\t` or `\n`.
    pub fn store(&self, record: &[u8]) -> LogResult<u64> {
        if record.contains(&b'\t') || record.contains(&b'\n') {
            return Err(LogError::Storage(
                "record must not contain TAB or NL".into(),
            ));
        }
        let _guard = self.acquire(true)?;
        let mut backend = self.backend.lock();
        let pos = backend.seek(SeekFrom::End(0))?;
        backend.write_all(&[b'\t'])?;
        backend.write_all(record)?;
        backend.write_all(&[b'\n'])?;
        backend.flush()?;
        Ok(pos)
    }

    /// Load the record at `offset`, stripped of its framing.
    pub fn load(&self, offset: u64) -> LogResult<Vec<u8>> {
        // Immutable, forward-only records don't need the header lock:
        // the offset was observed from an already-committed root, so
        // the bytes at it can't change out from under us.
        let mut backend = self.backend.lock();
        let line = Self::read_line_at(&mut backend, offset)?;
        if !line.starts_with(b"\t") {
            return Err(LogError::CorruptedFormat(format!(
                "missing marker at offset {offset}"
            )));
        }
        if line[1..line.len() - 1].contains(&b'\t') {
            return Err(LogError::CorruptedFormat(format!(
                "{offset} is not pointing at the beginning of a record"
            )));
        }
        Ok(line[1..line.len() - 1].to_vec())
    }

    /// Verify the whole file conforms to the format, raising on the
    /// first violation.
    pub fn scan(&self) -> LogResult<()> {
        let _guard = self.acquire(false)?;
        let mut backend = self.backend.lock();
        backend.seek(SeekFrom::Start(0))?;
        let ident = Self::read_line(&mut backend)?;
        Self::check_identifier(&ident)?;
        let root_line = Self::read_line(&mut backend)?;
        Self::parse_root_line(&root_line)?;
        loop {
            let mut byte = [0u8; 1];
            let pos = backend.seek(SeekFrom::Current(0))?;
            if backend.read(&mut byte)? == 0 {
                break;
            }
            if byte[0] != b'\t' {
                return Err(LogError::CorruptedFormat(format!(
                    "missing marker at offset {pos}"
                )));
            }
            let mut rest = vec![byte[0]];
            loop {
                let n = backend.read(&mut byte)?;
                if n == 0 {
                    return Err(LogError::CorruptedFormat(format!(
                        "unterminated line at offset {pos}"
                    )));
                }
                rest.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            if rest[1..rest.len() - 1].contains(&b'\t') {
                return Err(LogError::CorruptedFormat(format!(
                    "marker found within a record at offset {pos}"
                )));
            }
        }
        Ok(())
    }

    /// Enumerate every line of the file as `(offset, bytes)`, the
    /// identifier and root-pointer lines included (without their
    /// trailing `\n`).
    pub fn records(&self) -> LogResult<Vec<(u64, Vec<u8>)>> {
        let _guard = self.acquire(false)?;
        let mut backend = self.backend.lock();
        backend.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        let ident = Self::read_line(&mut backend)?;
        Self::check_identifier(&ident)?;
        out.push((0, ident[..ident.len() - 1].to_vec()));
        let root_pos = ident.len() as u64;
        let root_line = Self::read_line(&mut backend)?;
        Self::parse_root_line(&root_line)?;
        out.push((root_pos, root_line[..root_line.len() - 1].to_vec()));
        loop {
            let pos = backend.seek(SeekFrom::Current(0))?;
            let mut byte = [0u8; 1];
            if backend.read(&mut byte)? == 0 {
                break;
            }
            if byte[0] != b'\t' {
                return Err(LogError::CorruptedFormat(format!(
                    "missing marker at offset {pos}"
                )));
            }
            let mut rest = Vec::new();
            loop {
                let n = backend.read(&mut byte)?;
                if n == 0 {
                    return Err(LogError::CorruptedFormat(format!(
                        "unterminated line at offset {pos}"
                    )));
                }
                if byte[0] == b'\n' {
                    break;
                }
                rest.push(byte[0]);
            }
            if rest.contains(&b'\t') {
                return Err(LogError::CorruptedFormat(format!(
                    "marker found within a record at offset {pos}"
                )));
            }
            out.push((pos, rest));
        }
        Ok(out)
    }

    /// A human-readable `offset | record` dump, for the CLI and for
    /// debugging.
    pub fn dump(&self) -> LogResult<String> {
        let mut out = String::new();
        for (offset, record) in self.records()? {
            out.push_str(&format!(
                "{offset:4} | {}\n",
                String::from_utf8_lossy(&record)
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_current_is_zero() {
        let log = Log::open_in_memory().unwrap();
        assert_eq!(log.get_current().unwrap(), 0);
    }

    // P1: for every offset returned by store(), load(offset) == bytes.
    #[test]
    fn store_then_load_roundtrips() {
        let log = Log::open_in_memory().unwrap();
        let off1 = log.store(b"hello").unwrap();
        let off2 = log.store(b"world").unwrap();
        assert_eq!(log.load(off1).unwrap(), b"hello");
        assert_eq!(log.load(off2).unwrap(), b"world");
    }

    #[test]
    fn store_rejects_tab_and_newline() {
        let log = Log::open_in_memory().unwrap();
        assert!(log.store(b"has\ttab").is_err());
        assert!(log.store(b"has\nnewline").is_err());
    }

    #[test]
    fn set_current_cas_roundtrip() {
        let log = Log::open_in_memory().unwrap();
        let off = log.store(b"record").unwrap();
        log.set_current(off, Some(0)).unwrap();
        assert_eq!(log.get_current().unwrap(), off);
    }

    // P5: CAS rejects a commit against a stale observed root.
    #[test]
    fn set_current_rejects_stale_expectation() {
        let log = Log::open_in_memory().unwrap();
        let off = log.store(b"record").unwrap();
        log.set_current(off, Some(0)).unwrap();
        let err = log.set_current(off, Some(0)).unwrap_err();
        assert!(matches!(err, LogError::Concurrency { .. }));
    }

    // P2 / scenario 3: flipping the leading TAB to a space is detected
    // both by scan() and by load() at that offset.
    #[test]
    fn corrupted_marker_is_detected() {
        let log = Log::open_in_memory().unwrap();
        let off = log.store(b"record").unwrap();
        {
            let mut backend = log.backend.lock();
            backend.seek(SeekFrom::Start(off)).unwrap();
            backend.write_all(b" ").unwrap();
        }
        assert!(matches!(
            log.scan().unwrap_err(),
            LogError::CorruptedFormat(_)
        ));
        assert!(matches!(
            log.load(off).unwrap_err(),
            LogError::CorruptedFormat(_)
        ));
    }

    #[test]
    fn nested_lock_is_rejected() {
        let log = Log::open_in_memory().unwrap();
        let _g = log.acquire(false).unwrap();
        assert!(matches!(
            log.acquire(true).unwrap_err(),
            LogError::Storage(_)
        ));
    }

    #[test]
    fn scan_accepts_a_freshly_created_file() {
        let log = Log::open_in_memory().unwrap();
        log.scan().unwrap();
        log.store(b"x").unwrap();
        log.scan().unwrap();
    }
}
