//! Socket delivery for the reader send path.
//!
//! Plain TCP uses the zero-copy `sendfile` syscall to move chunk bytes
//! from the segment file into the socket. TLS cannot use sendfile, so
//! the body is read into a bounded buffer and written through the
//! stream instead.

use std::fs::File;
use std::io::{self, ErrorKind, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;

use nix::sys::sendfile::sendfile;
use openssl::ssl::SslStream;
use serde::{Deserialize, Serialize};

use crate::tools;

const SSL_COPY_BUFFER: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ssl,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

/// A connected client socket of either transport.
pub enum Socket {
    Tcp(TcpStream),
    Ssl(Box<SslStream<TcpStream>>),
}

impl Socket {
    pub fn transport(&self) -> Transport {
        match self {
            Socket::Tcp(_) => Transport::Tcp,
            Socket::Ssl(_) => Transport::Ssl,
        }
    }

    /// Write a full byte run (used for chunk headers).
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.write_all(bytes),
            Socket::Ssl(stream) => stream.write_all(bytes),
        }
    }

    /// Transfer `len` bytes of `file` starting at `offset` into the
    /// socket, resuming partial sends until the run is complete.
    pub fn sendfile(&mut self, file: &File, offset: u64, len: u64) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => {
                let mut file_offset = offset as libc::off_t;
                let mut remaining = len as usize;
                while remaining > 0 {
                    match sendfile(
                        stream.as_raw_fd(),
                        file.as_raw_fd(),
                        Some(&mut file_offset),
                        remaining,
                    ) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                ErrorKind::UnexpectedEof,
                                "sendfile hit EOF before the chunk end",
                            ));
                        }
                        Ok(sent) => remaining -= sent,
                        Err(err) => match err.as_errno() {
                            Some(nix::errno::Errno::EINTR)
                            | Some(nix::errno::Errno::EAGAIN) => continue,
                            Some(errno) => {
                                return Err(io::Error::from_raw_os_error(errno as i32))
                            }
                            None => return Err(io::Error::new(ErrorKind::Other, err)),
                        },
                    }
                }
                Ok(())
            }
            Socket::Ssl(stream) => {
                let mut buf = vec![0u8; SSL_COPY_BUFFER];
                let mut pos = offset;
                let end = offset + len;
                while pos < end {
                    let want = ((end - pos) as usize).min(buf.len());
                    tools::pread_exact(file, &mut buf[..want], pos)?;
                    stream.write_all(&buf[..want])?;
                    pos += want as u64;
                }
                Ok(())
            }
        }
    }
}
