// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;
use std::io::{Error, ErrorKind};
use std::os::unix::io::RawFd;
use std::time;

/// An opaque connection identifier.
///
/// A `Uuid` packs the file descriptor of a connection together with a
/// generation counter. Each time a descriptor is recycled the generation
/// is incremented, so a `Uuid` kept around after its connection closed
/// can never address the descriptor's next occupant: every socket call
/// taking a stale `Uuid` fails with [`SockError::BadUuid`](enum.SockError.html).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Uuid(u64);

impl Uuid {
    pub fn compose(fd: RawFd, gen: u32) -> Uuid {
        Uuid(((gen as u64) << 32) | (fd as u32 as u64))
    }

    pub fn fd(&self) -> RawFd {
        (self.0 & 0xFFFF_FFFF) as RawFd
    }

    pub fn gen(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}.{}", self.fd(), self.gen())
    }
}

/// Failures reported by the socket API.
#[derive(Debug)]
pub enum SockError {
    /// The generation encoded in the uuid no longer matches its slot.
    BadUuid,
    /// The connection is closed or closing.
    Closed,
    /// No protocol is attached to the connection.
    NotAttached,
    /// The operation cannot make progress right now.
    WouldBlock,
    Io(io::Error)
}

impl SockError {
    pub fn name(&self) -> &'static str {
        match *self {
            SockError::BadUuid     => "BadUuid",
            SockError::Closed      => "Closed",
            SockError::NotAttached => "NotAttached",
            SockError::WouldBlock  => "WouldBlock",
            SockError::Io(_)       => "Io"
        }
    }
}

impl From<io::Error> for SockError {
    fn from(err: io::Error) -> SockError {
        match err.kind() {
            ErrorKind::WouldBlock      => SockError::WouldBlock,
            ErrorKind::BrokenPipe      => SockError::Closed,
            ErrorKind::ConnectionReset => SockError::Closed,
            _ => SockError::Io(err)
        }
    }
}

impl fmt::Display for SockError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SockError::Io(ref e) => write!(formatter, "Io({})", e),
            _ => formatter.write_str(self.name())
        }
    }
}

pub type SockResult<T> = Result<T, SockError>;

pub fn other_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::Other, msg)
}

pub fn invalid_data_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

pub fn would_block_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::WouldBlock, msg)
}

pub fn invalid_input_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

pub trait ToMillis {
    fn to_millis(&self) -> u64;
}

impl ToMillis for time::Duration {
    fn to_millis(&self) -> u64 {
        let millis_from_secs = self.as_secs() * 1_000;
        let millis_from_nanos = self.subsec_nanos() as f64 / 1_000_000f64;

        millis_from_secs + millis_from_nanos as u64
    }
}

#[cfg(test)]
mod tests {
    use super::Uuid;

    #[test]
    fn uuid_packs_fd_and_generation() {
        let uuid = Uuid::compose(7, 3);

        assert_eq!(7, uuid.fd());
        assert_eq!(3, uuid.gen());
    }

    #[test]
    fn uuid_generations_differ() {
        let old = Uuid::compose(7, 3);
        let new = Uuid::compose(7, 4);

        assert!(old != new);
        assert_eq!(old.fd(), new.fd());
    }
}
