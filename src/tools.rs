//! Small file and time helpers shared by the storage modules.

use std::fs::File;
use std::io::{Error, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::uio::pread;

use crate::error::StoreError;

fn nix_to_io(err: nix::Error) -> Error {
    match err.as_errno() {
        Some(errno) => Error::from_raw_os_error(errno as i32),
        None => Error::new(ErrorKind::Other, err),
    }
}

/// Positioned read filling as much of `buf` as the file holds.
///
/// Returns the number of bytes read, which is only smaller than the
/// buffer when EOF was hit. The file cursor is not touched, so the
/// writer and many readers can share a file without seek coordination.
pub fn pread_some(file: &File, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
    let fd = file.as_raw_fd();
    let mut done = 0;
    while done < buf.len() {
        match pread(fd, &mut buf[done..], (offset + done as u64) as libc::off_t) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) => match err.as_errno() {
                Some(nix::errno::Errno::EINTR) => continue,
                _ => return Err(nix_to_io(err)),
            },
        }
    }
    Ok(done)
}

/// Positioned read that fails with `UnexpectedEof` on a short read.
pub fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<(), Error> {
    let done = pread_some(file, buf, offset)?;
    if done < buf.len() {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            format!("short read: got {} of {} bytes", done, buf.len()),
        ));
    }
    Ok(())
}

/// Open a file read-only, mapping `ENOENT` to `StoreError::MissingFile`
/// so callers can catch the race against retention deleting the path.
pub fn open_read(path: &Path) -> Result<File, StoreError> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(StoreError::MissingFile(path.to_owned()))
        }
        Err(err) => Err(err.into()),
    }
}

/// List files in `dir` with the given extension, sorted by file name.
pub fn list_sorted(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Wall clock in milliseconds, the timestamp unit of the chunk format.
pub fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(_) => 0,
    }
}
