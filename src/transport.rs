// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The byte stream a connection runs over.
///
/// Everything the reactor does to a peer goes through this trait, so a
/// TLS shim (or any other transform) can sit between the framework and
/// the wire by implementing it: the buffered `writev`/`sendfile`
/// defaults keep working, the kernel fast paths are opt-in overrides.

use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use iovec::IoVec;
use iovec::unix as iovec_unix;
use libc;

use mio;
use mio_uds;

pub trait Transport : Read + Write + Send {
    fn fd(&self) -> RawFd;

    /// Non-blocking error query after an in-progress connect.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    /// Gathering write. The default degrades to a plain write of the
    /// first buffer, which keeps transforms that must see every byte
    /// correct at the cost of extra syscalls.
    fn writev(&mut self, bufs: &[&IoVec]) -> io::Result<usize> {
        match bufs.first() {
            Some(buf) => self.write(buf),
            None => Ok(0)
        }
    }

    /// Copy up to `count` bytes from `file` at `*offset` into the stream,
    /// advancing `*offset` by the amount consumed. The default reads
    /// through user space so transforms keep seeing the payload.
    fn sendfile(&mut self, file: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let wanted = ::std::cmp::min(count, chunk.len());
        let read = pread(file, &mut chunk[..wanted], *offset)?;

        if read == 0 {
            return Ok(0);
        }

        let written = self.write(&chunk[..read])?;

        *offset += written as u64;
        Ok(written)
    }
}

impl Transport for mio::net::TcpStream {
    fn fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn writev(&mut self, bufs: &[&IoVec]) -> io::Result<usize> {
        writev(self.as_raw_fd(), bufs)
    }

    fn sendfile(&mut self, file: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
        sendfile(self.as_raw_fd(), file, offset, count)
    }
}

impl Transport for mio_uds::UnixStream {
    fn fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio_uds::UnixStream::take_error(self)
    }

    fn writev(&mut self, bufs: &[&IoVec]) -> io::Result<usize> {
        writev(self.as_raw_fd(), bufs)
    }

    fn sendfile(&mut self, file: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
        sendfile(self.as_raw_fd(), file, offset, count)
    }
}

pub fn writev(fd: RawFd, bufs: &[&IoVec]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let iovs = iovec_unix::as_os_slice(bufs);

    loop {
        let rv = unsafe { libc::writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };

        if rv >= 0 {
            return Ok(rv as usize);
        }

        let err = io::Error::last_os_error();

        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        let rv = unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t)
        };

        if rv >= 0 {
            return Ok(rv as usize);
        }

        let err = io::Error::last_os_error();

        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(target_os = "linux")]
pub fn sendfile(out: RawFd, file: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    loop {
        let mut off = *offset as libc::off_t;
        let rv = unsafe { libc::sendfile(out, file, &mut off, count) };

        if rv >= 0 {
            *offset = off as u64;
            return Ok(rv as usize);
        }

        let err = io::Error::last_os_error();

        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sendfile(out: RawFd, file: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut chunk = [0u8; 16 * 1024];
    let wanted = ::std::cmp::min(count, chunk.len());
    let read = pread(file, &mut chunk[..wanted], *offset)?;

    if read == 0 {
        return Ok(0);
    }

    let written = write_fd(out, &chunk[..read])?;

    *offset += written as u64;
    Ok(written)
}

#[cfg(not(target_os = "linux"))]
fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let rv = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

        if rv >= 0 {
            return Ok(rv as usize);
        }

        let err = io::Error::last_os_error();

        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
