//! Byte streams the bus moves packets over.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

/// Identity of the open file behind a descriptor. Two descriptors with the
/// same identity are the same socket or file, which is how a packet is kept
/// from being written back to the connection it arrived on.
///
/// Character devices have none: stdin and stdout on one terminal are the
/// same inode but separate inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// Files, FIFOs, character devices, and the process's stdin/stdout.
    File(File),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Stream> {
        Ok(match self {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::File(f) => Stream::File(f.try_clone()?),
        })
    }

    pub fn identity(&self) -> Option<StreamIdentity> {
        let dup = File::from(self.as_fd().try_clone_to_owned().ok()?);
        let meta = dup.metadata().ok()?;
        if meta.file_type().is_char_device() {
            return None;
        }
        Some(StreamIdentity {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn is_socket(&self) -> bool {
        matches!(self, Stream::Tcp(_) | Stream::Unix(_))
    }

    pub fn is_regular_file(&self) -> bool {
        match self {
            Stream::File(f) => f.metadata().map(|m| m.is_file()).unwrap_or(false),
            _ => false,
        }
    }

    /// Stop sending. Sockets get a half-close; files have no equivalent.
    pub fn shutdown_write(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Write),
            Stream::Unix(s) => s.shutdown(Shutdown::Write),
            Stream::File(_) => Ok(()),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
            Stream::File(f) => f.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
            Stream::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
            Stream::File(f) => f.flush(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
            Stream::File(f) => f.as_fd(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// Enable TCP keepalive: first probe after 30 s idle, then every 10 s, three
/// misses drop the connection.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10))
        .with_retries(3);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
