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

//! Advisory, blocking, byte-range locking on byte 1 of a file.
//!
//! This is process-shared locking (not an in-process mutex): two
//! handles in the same process, or two different processes, both
//! opening the same path, contend for the same range. Unlike a
//! whole-file `flock(2)`, byte-range locks let unrelated readers keep
//! working on offsets elsewhere in the file without participating in
//! the header's lock at all.

use std::fs::File;
use std::io;

/// Byte offset and length of the coordination range (see the file
/// format: byte 0 starts the identifier line, byte 1 is within it,
/// which is all we need to exclude other lockers).
const LOCK_START: u64 = 1;
const LOCK_LEN: u64 = 1;

pub fn lock_shared(file: &File) -> io::Result<()> {
    sys::lock(file, false)
}

pub fn lock_exclusive(file: &File) -> io::Result<()> {
    sys::lock(file, true)
}

pub fn unlock(file: &File) -> io::Result<()> {
    sys::unlock(file)
}

#[cfg(unix)]
mod sys {
    use super::{LOCK_LEN, LOCK_START};
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn make_lock(l_type: libc::c_short) -> libc::flock {
        let mut lk: libc::flock = unsafe { std::mem::zeroed() };
        lk.l_type = l_type;
        lk.l_whence = libc::SEEK_SET as libc::c_short;
        lk.l_start = LOCK_START as libc::off_t;
        lk.l_len = LOCK_LEN as libc::off_t;
        lk
    }

    pub fn lock(file: &File, exclusive: bool) -> io::Result<()> {
        let mut lk = make_lock(if exclusive { libc::F_WRLCK } else { libc::F_RDLCK } as libc::c_short);
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut lk) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let mut lk = make_lock(libc::F_UNLCK as libc::c_short);
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut lk) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::{LOCK_LEN, LOCK_START};
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFile, LOCKFILE_EXCLUSIVE_LOCK, LOCK_FILE_FLAGS,
    };
    use windows::Win32::System::IO::OVERLAPPED;

    fn overlapped_at(start: u64) -> OVERLAPPED {
        let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
        ov.Anonymous.Anonymous.Offset = start as u32;
        ov.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
        ov
    }

    pub fn lock(file: &File, exclusive: bool) -> io::Result<()> {
        let handle = HANDLE(file.as_raw_handle() as isize);
        let flags: LOCK_FILE_FLAGS = if exclusive {
            LOCKFILE_EXCLUSIVE_LOCK
        } else {
            LOCK_FILE_FLAGS(0)
        };
        let mut ov = overlapped_at(LOCK_START);
        let ok = unsafe {
            LockFileEx(
                handle,
                flags,
                0,
                LOCK_LEN as u32,
                0,
                &mut ov,
            )
        };
        ok.map_err(|e| io::Error::from_raw_os_error(e.code().0))
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let handle = HANDLE(file.as_raw_handle() as isize);
        let ok = unsafe { UnlockFile(handle, LOCK_START as u32, 0, LOCK_LEN as u32, 0) };
        ok.map_err(|e| io::Error::from_raw_os_error(e.code().0))
    }
}
