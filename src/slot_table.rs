// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The connection table: a fixed array indexed by file descriptor.
///
/// Each slot carries a generation counter that is part of the public
/// [`Uuid`](struct.Uuid.html). The counter is incremented after the
/// slot's `on_close` ran and before the descriptor can be reused, so a
/// callback holding a stale uuid can never touch the descriptor's next
/// occupant. Every user-facing call validates the generation first and
/// returns `BadUuid` without side effects when it no longer matches.

use std::mem;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::os::unix::io::RawFd;

use libc;

use mio;

use global::*;
use protocol::{Factory, Protocol};
use transport::Transport;
use write_queue::WriteQueue;

// slot lifecycle; transitions are one way until the slot is freed
pub const FREE: usize = 0;
pub const OPEN: usize = 1;
/// Close requested; writes enqueued from here on never reach the wire.
pub const CLOSING: usize = 2;
/// `on_shutdown` in progress; the goodbye frame is still accepted.
pub const SHUTDOWN: usize = 3;
/// Grace drain before `on_close`.
pub const DRAIN: usize = 4;

pub enum SlotIo {
    Stream {
        stream: Box<Transport>,
        queue: WriteQueue,
        /// Present while an outbound connect is still in flight.
        factory: Option<Box<Factory>>,
        /// Connection-owned subscriptions, revoked on close.
        subs: Vec<u64>
    },
    Listener {
        listener: mio::net::TcpListener,
        factory: Box<Factory>
    }
}

pub struct Slot {
    gen: AtomicUsize,
    state: AtomicUsize,
    timeout: AtomicUsize,
    active_at: AtomicUsize,
    /// The connection lock: callbacks run while holding it.
    pub proto: Mutex<Option<Box<Protocol>>>,
    pub io: Mutex<Option<SlotIo>>
}

impl Slot {
    fn new() -> Slot {
        Slot {
            gen: AtomicUsize::new(0),
            state: AtomicUsize::new(FREE),
            timeout: AtomicUsize::new(0),
            active_at: AtomicUsize::new(0),
            proto: Mutex::new(None),
            io: Mutex::new(None)
        }
    }

    pub fn state(&self) -> usize {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: usize) {
        self.state.store(state, Ordering::Release);
    }

    /// One-way transition; fails when another thread moved first.
    pub fn transition(&self, from: usize, to: usize) -> bool {
        self.state.compare_and_swap(from, to, Ordering::AcqRel) == from
    }

    pub fn gen(&self) -> u32 {
        self.gen.load(Ordering::Acquire) as u32
    }

    pub fn bump_gen(&self) {
        self.gen.fetch_add(1, Ordering::AcqRel);
    }

    pub fn writable_state(&self) -> bool {
        let state = self.state();

        state == OPEN || state == SHUTDOWN
    }

    pub fn set_timeout(&self, seconds: u8) {
        self.timeout.store(seconds as usize, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> usize {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now_seconds: usize) {
        self.active_at.store(now_seconds, Ordering::Relaxed);
    }

    pub fn active_at(&self) -> usize {
        self.active_at.load(Ordering::Relaxed)
    }
}

pub struct SlotTable {
    slots: Vec<Slot>,
    max_fd: AtomicUsize
}

impl SlotTable {
    pub fn new(capacity: usize) -> SlotTable {
        let mut slots = Vec::with_capacity(capacity);

        for _ in 0..capacity {
            slots.push(Slot::new());
        }

        SlotTable {
            slots: slots,
            max_fd: AtomicUsize::new(0)
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest descriptor ever claimed, bounding timeout sweeps.
    pub fn max_fd(&self) -> usize {
        self.max_fd.load(Ordering::Relaxed)
    }

    pub fn slot(&self, fd: RawFd) -> Option<&Slot> {
        self.slots.get(fd as usize)
    }

    /// Takes ownership of a freshly opened descriptor and returns its
    /// uuid. The descriptor number itself proves uniqueness: the kernel
    /// cannot hand out an fd that is still open elsewhere.
    pub fn claim(&self, fd: RawFd, io: SlotIo, timeout: u8, now_seconds: usize) -> SockResult<Uuid> {
        let slot = match self.slot(fd) {
            Some(slot) => slot,
            None => return Err(SockError::Io(other_io_error("fd beyond the connection table")))
        };

        *slot.io.lock().unwrap() = Some(io);
        *slot.proto.lock().unwrap() = None;
        slot.set_timeout(timeout);
        slot.touch(now_seconds);
        slot.set_state(OPEN);

        let mut max = self.max_fd.load(Ordering::Relaxed);

        while (fd as usize) > max {
            max = self.max_fd.compare_and_swap(max, fd as usize, Ordering::Relaxed);
        }

        Ok(Uuid::compose(fd, slot.gen()))
    }

    /// Validates the generation and liveness of a uuid.
    pub fn check(&self, uuid: Uuid) -> SockResult<&Slot> {
        let slot = match self.slot(uuid.fd()) {
            Some(slot) => slot,
            None => return Err(SockError::BadUuid)
        };

        if slot.gen() != uuid.gen() || slot.state() == FREE {
            return Err(SockError::BadUuid);
        }

        Ok(slot)
    }
}

/// Sizes the table from the `RLIMIT_NOFILE` soft limit. The cap keeps
/// slot memory sane on hosts with six-digit descriptor limits; servers
/// that really want more pass `Config::capacity`.
pub fn default_capacity() -> usize {
    const CAP: usize = 1 << 15;

    unsafe {
        let mut limit: libc::rlimit = mem::zeroed();

        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            return 1024;
        }

        ::std::cmp::max(64, ::std::cmp::min(limit.rlim_cur as usize, CAP))
    }
}

#[cfg(test)]
mod tests {
    use global::SockError;
    use write_queue::WriteQueue;

    use super::*;

    fn stream_io() -> SlotIo {
        struct Null;

        impl ::std::io::Read for Null {
            fn read(&mut self, _: &mut [u8]) -> ::std::io::Result<usize> {
                Ok(0)
            }
        }
        impl ::std::io::Write for Null {
            fn write(&mut self, buf: &[u8]) -> ::std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> ::std::io::Result<()> {
                Ok(())
            }
        }
        impl ::transport::Transport for Null {
            fn fd(&self) -> ::std::os::unix::io::RawFd {
                -1
            }
        }

        SlotIo::Stream {
            stream: Box::new(Null),
            queue: WriteQueue::new(),
            factory: None,
            subs: Vec::new()
        }
    }

    #[test]
    fn stale_uuid_is_rejected() {
        let table = SlotTable::new(16);
        let uuid = table.claim(7, stream_io(), 0, 0).unwrap();

        assert!(table.check(uuid).is_ok());

        // close: generation moves, slot is freed and reclaimed
        {
            let slot = table.slot(7).unwrap();

            *slot.io.lock().unwrap() = None;
            slot.bump_gen();
            slot.set_state(FREE);
        }

        match table.check(uuid) {
            Err(SockError::BadUuid) => (),
            other => panic!("expected BadUuid, got {:?}", other.map(|_| ()))
        }

        let reused = table.claim(7, stream_io(), 0, 0).unwrap();

        assert!(reused != uuid);
        assert!(table.check(reused).is_ok());
        assert!(table.check(uuid).is_err());
    }

    #[test]
    fn free_slot_with_matching_generation_is_rejected() {
        let table = SlotTable::new(16);
        let uuid = Uuid::compose(3, 0);

        match table.check(uuid) {
            Err(SockError::BadUuid) => (),
            _ => panic!("expected BadUuid")
        }
    }
}
