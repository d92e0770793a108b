// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// Readiness notification with one-shot edge-triggered semantics.
///
/// Both backends honour the same contract: an event is reported once and
/// interest for the descriptor is cleared until `monitor` re-arms it.
/// The default backend maps straight onto the platform notification
/// facility through mio; the portable backend runs `poll(2)` and masks
/// the readiness it already reported to keep the one-shot contract.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use libc;

use mio;
use mio::unix::{EventedFd, UnixReady};

#[derive(Debug, Copy, Clone)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub errored: bool
}

pub struct Poller {
    inner: RwLock<Inner>
}

struct Inner {
    kind: Kind,
    wake_rx: RawFd,
    wake_tx: RawFd
}

enum Kind {
    Edge {
        poll: mio::Poll,
        events: Mutex<mio::Events>,
        registered: Mutex<Vec<bool>>
    },
    Portable {
        interest: Mutex<HashMap<RawFd, (bool, bool)>>
    }
}

impl Poller {
    pub fn new(portable: bool, capacity: usize) -> io::Result<Poller> {
        let inner = Inner::new(portable, capacity)?;

        Ok(Poller { inner: RwLock::new(inner) })
    }

    /// Replaces the notification facility with a fresh one. Called once
    /// in a freshly forked worker, before any thread is spawned.
    pub fn reopen(&self) -> io::Result<()> {
        let mut guard = self.inner.write().unwrap();
        let portable = match guard.kind {
            Kind::Portable { .. } => true,
            Kind::Edge { .. } => false
        };
        let capacity = match guard.kind {
            Kind::Edge { ref registered, .. } => registered.lock().unwrap().len(),
            Kind::Portable { .. } => 0
        };

        *guard = Inner::new(portable, capacity)?;
        Ok(())
    }

    /// Arms interest for one descriptor. Passing `false` for both sides
    /// leaves the descriptor silent until the next call.
    pub fn monitor(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        self.inner.read().unwrap().monitor(fd, read, write)
    }

    pub fn forget(&self, fd: RawFd) {
        self.inner.read().unwrap().forget(fd)
    }

    pub fn wait(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.read().unwrap().wait(out, timeout)
    }

    /// Interrupts a blocked `wait` from another thread.
    pub fn wake(&self) {
        wake_fd(self.inner.read().unwrap().wake_tx)
    }

    pub fn wake_handle(&self) -> RawFd {
        self.inner.read().unwrap().wake_tx
    }
}

/// Async-signal-safe wakeup: a single write to the self-pipe.
pub fn wake_fd(fd: RawFd) {
    let byte = [1u8];

    unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
}

impl Inner {
    fn new(portable: bool, capacity: usize) -> io::Result<Inner> {
        let (wake_rx, wake_tx) = self_pipe()?;
        let kind = if portable {
            Kind::Portable { interest: Mutex::new(HashMap::new()) }
        } else {
            let poll = mio::Poll::new()?;

            poll.register(&EventedFd(&wake_rx),
                          mio::Token(wake_rx as usize),
                          mio::Ready::readable(),
                          mio::PollOpt::edge())?;
            Kind::Edge {
                poll: poll,
                events: Mutex::new(mio::Events::with_capacity(1024)),
                registered: Mutex::new(vec![false; capacity])
            }
        };

        Ok(Inner {
            kind: kind,
            wake_rx: wake_rx,
            wake_tx: wake_tx
        })
    }

    fn monitor(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        match self.kind {
            Kind::Edge { ref poll, ref registered, .. } => {
                let mut ready = mio::Ready::from(UnixReady::hup() | UnixReady::error());

                if read {
                    ready.insert(mio::Ready::readable());
                }
                if write {
                    ready.insert(mio::Ready::writable());
                }

                let opts = mio::PollOpt::edge() | mio::PollOpt::oneshot();
                let mut flags = registered.lock().unwrap();
                let slot = fd as usize;

                if slot >= flags.len() {
                    flags.resize(slot + 1, false);
                }
                if flags[slot] {
                    poll.reregister(&EventedFd(&fd), mio::Token(slot), ready, opts)
                } else {
                    poll.register(&EventedFd(&fd), mio::Token(slot), ready, opts)?;
                    flags[slot] = true;
                    Ok(())
                }
            }
            Kind::Portable { ref interest } => {
                self.check_wakeable(fd)?;
                interest.lock().unwrap().insert(fd, (read, write));
                Ok(())
            }
        }
    }

    fn check_wakeable(&self, fd: RawFd) -> io::Result<()> {
        if fd == self.wake_rx || fd == self.wake_tx {
            Err(::global::invalid_input_io_error("fd is reserved for wakeups"))
        } else {
            Ok(())
        }
    }

    fn forget(&self, fd: RawFd) {
        match self.kind {
            Kind::Edge { ref poll, ref registered, .. } => {
                let mut flags = registered.lock().unwrap();
                let slot = fd as usize;

                if slot < flags.len() && flags[slot] {
                    flags[slot] = false;
                    let _ = poll.deregister(&EventedFd(&fd));
                }
            }
            Kind::Portable { ref interest } => {
                interest.lock().unwrap().remove(&fd);
            }
        }
    }

    fn wait(&self, out: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        match self.kind {
            Kind::Edge { ref poll, ref events, .. } => {
                let mut events = events.lock().unwrap();

                poll.poll(&mut events, timeout)?;

                for event in events.iter() {
                    let fd = event.token().0 as RawFd;

                    if fd == self.wake_rx {
                        drain_fd(self.wake_rx);
                        continue;
                    }

                    let ready = event.readiness();
                    let unix = UnixReady::from(ready);

                    out.push(PollEvent {
                        fd: fd,
                        readable: ready.is_readable(),
                        writable: ready.is_writable(),
                        errored: unix.is_error() || unix.is_hup()
                    });
                }
                Ok(())
            }
            Kind::Portable { ref interest } => {
                self.wait_portable(interest, out, timeout)
            }
        }
    }

    fn wait_portable(&self,
                     interest: &Mutex<HashMap<RawFd, (bool, bool)>>,
                     out: &mut Vec<PollEvent>,
                     timeout: Option<Duration>) -> io::Result<()> {
        use global::ToMillis;

        let mut pollfds = Vec::new();

        pollfds.push(libc::pollfd { fd: self.wake_rx, events: libc::POLLIN, revents: 0 });

        {
            let map = interest.lock().unwrap();

            for (&fd, &(read, write)) in map.iter() {
                let mut events = 0 as libc::c_short;

                if read {
                    events |= libc::POLLIN;
                }
                if write {
                    events |= libc::POLLOUT;
                }
                if events != 0 {
                    pollfds.push(libc::pollfd { fd: fd, events: events, revents: 0 });
                }
            }
        }

        let ms = match timeout {
            Some(d) => d.to_millis() as libc::c_int,
            None => -1
        };
        let rv = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, ms) };

        if rv < 0 {
            let err = io::Error::last_os_error();

            return if err.kind() == io::ErrorKind::Interrupted { Ok(()) } else { Err(err) };
        }

        let mut map = interest.lock().unwrap();

        for pollfd in pollfds.iter() {
            if pollfd.revents == 0 {
                continue;
            }
            if pollfd.fd == self.wake_rx {
                drain_fd(self.wake_rx);
                continue;
            }

            let readable = pollfd.revents & libc::POLLIN != 0;
            let writable = pollfd.revents & libc::POLLOUT != 0;
            let errored = pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;

            // mask what was just reported so the next wait stays silent
            // until the reactor re-arms, mirroring the one-shot backend
            if let Some(entry) = map.get_mut(&pollfd.fd) {
                if readable || errored {
                    entry.0 = false;
                }
                if writable || errored {
                    entry.1 = false;
                }
            }

            out.push(PollEvent {
                fd: pollfd.fd,
                readable: readable,
                writable: writable,
                errored: errored
            });
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_rx);
            libc::close(self.wake_tx);
        }
    }
}

fn self_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];

    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    for &fd in fds.iter() {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    Ok((fds[0], fds[1]))
}

fn drain_fd(fd: RawFd) {
    let mut sink = [0u8; 64];

    loop {
        let rv = unsafe { libc::read(fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) };

        if rv <= 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn wakeup_interrupts_wait() {
        let poller = Poller::new(false, 8).unwrap();
        let mut events = Vec::new();

        poller.wake();
        poller.wait(&mut events, Some(Duration::from_millis(500))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn portable_backend_reports_once() {
        let poller = Poller::new(true, 8).unwrap();
        let (rx, tx) = super::self_pipe().unwrap();

        super::wake_fd(tx);
        poller.monitor(rx, true, false).unwrap();

        let mut events = Vec::new();

        poller.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(1, events.len());
        assert!(events[0].readable);

        // not re-armed: the second wait must stay silent
        events.clear();
        poller.wait(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());

        unsafe {
            ::libc::close(rx);
            ::libc::close(tx);
        }
    }
}
