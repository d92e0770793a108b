// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc;

use mio;

use cluster::{self, ClusterState};
use config::Config;
use global::*;
use loop_msg::Task;
use poller::Poller;
use protocol::{Factory, Protocol};
use pubsub::{self, Engine, Message, RefChange, Subscribe};
use slot_table::{self, SlotIo, SlotTable, OPEN, CLOSING};
use supervisor;
use timer::{DeferFifo, TimerSet};
use write_queue::{Chunk, WriteQueue};

use std::sync::Mutex;

pub struct Core {
    pub config: Config,
    pub table: SlotTable,
    pub fifo: DeferFifo,
    pub timers: TimerSet,
    pub poller: Poller,
    pub engine: Engine,
    pub running: AtomicBool,
    pub is_worker: AtomicBool,
    /// Cleared in a master that forked workers: accepting is their job.
    pub accepting: AtomicBool,
    pub master_pid: libc::pid_t,
    pub cluster: Mutex<ClusterState>
}

/// Handle on the framework; every public operation goes through it.
///
/// The handle is cheap to clone and safe to use from any thread. All
/// connection-taking calls validate the uuid generation first and fail
/// with `BadUuid` or `Closed` without side effects when the connection
/// is gone.
#[derive(Clone)]
pub struct Runtime {
    core: Arc<Core>
}

impl Runtime {
    pub fn new(config: Config) -> io::Result<Runtime> {
        let capacity = if config.capacity > 0 { config.capacity } else { slot_table::default_capacity() };
        let poller = Poller::new(config.portable_poll, capacity)?;

        info!("runtime: {} connection slots, {} worker(s), {} thread(s)",
              capacity, config.worker_count(), config.thread_count());

        Ok(Runtime {
            core: Arc::new(Core {
                config: config,
                table: SlotTable::new(capacity),
                fifo: DeferFifo::new(),
                timers: TimerSet::new(),
                poller: poller,
                engine: Engine::new(),
                running: AtomicBool::new(false),
                is_worker: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                master_pid: unsafe { libc::getpid() },
                cluster: Mutex::new(ClusterState::new())
            })
        })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Binds `addr` ("ip:port") and hands accepted connections to the
    /// factory. Non-blocking; accepting starts with the reactor.
    pub fn listen(&self, addr: &str, factory: Box<Factory>) -> io::Result<Uuid> {
        let sockaddr: SocketAddr = addr.parse()
            .map_err(|_| invalid_input_io_error("unparseable listen address"))?;
        let listener = mio::net::TcpListener::bind(&sockaddr)?;
        let fd = {
            use std::os::unix::io::AsRawFd;

            listener.as_raw_fd()
        };
        let io = SlotIo::Listener { listener: listener, factory: factory };
        let uuid = self.claim(fd, io, 0)?;

        debug!("[{:?}] listening on {}", uuid, addr);

        if self.core.running.load(Ordering::Acquire) && self.core.accepting.load(Ordering::Acquire) {
            self.core.poller.monitor(fd, true, false)?;
        }
        Ok(uuid)
    }

    /// Starts a non-blocking connect; the factory hears about the
    /// outcome through `on_open` or `on_fail`.
    pub fn connect(&self, addr: &str, factory: Box<Factory>) -> io::Result<Uuid> {
        let sockaddr: SocketAddr = addr.parse()
            .map_err(|_| invalid_input_io_error("unparseable connect address"))?;
        let stream = mio::net::TcpStream::connect(&sockaddr)?;
        let fd = {
            use std::os::unix::io::AsRawFd;

            stream.as_raw_fd()
        };
        let io = SlotIo::Stream {
            stream: Box::new(stream),
            queue: WriteQueue::new(),
            factory: Some(factory),
            subs: Vec::new()
        };
        let uuid = self.claim(fd, io, 0)?;

        debug!("[{:?}] connecting to {}", uuid, addr);

        if self.core.running.load(Ordering::Acquire) {
            self.core.poller.monitor(fd, false, true)?;
        }
        Ok(uuid)
    }

    fn claim(&self, fd: libc::c_int, io: SlotIo, timeout: u8) -> io::Result<Uuid> {
        match self.core.table.claim(fd, io, timeout, coarse_seconds()) {
            Ok(uuid) => Ok(uuid),
            Err(SockError::Io(e)) => Err(e),
            Err(e) => Err(other_io_error(e.name()))
        }
    }

    /// Reads available bytes. `Closed` doubles as end-of-stream.
    pub fn read(&self, uuid: Uuid, buf: &mut [u8]) -> SockResult<usize> {
        let slot = self.core.table.check(uuid)?;

        if slot.state() != OPEN {
            return Err(SockError::Closed);
        }

        let mut io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Stream { ref mut stream, .. }) => {
                loop {
                    match stream.read(buf) {
                        Ok(0) if !buf.is_empty() => return Err(SockError::Closed),
                        Ok(n) => {
                            slot.touch(coarse_seconds());
                            return Ok(n);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(SockError::from(e))
                    }
                }
            }
            Some(SlotIo::Listener { .. }) => Err(SockError::NotAttached),
            None => Err(SockError::Closed)
        }
    }

    /// Copies `buf` into the outgoing queue.
    pub fn write(&self, uuid: Uuid, buf: Vec<u8>) -> SockResult<()> {
        self.write_chunk(uuid, Chunk::Mem(buf))
    }

    /// Queues one chunk; bytes leave the socket strictly in enqueue
    /// order, memory and file chunks alike.
    pub fn write_chunk(&self, uuid: Uuid, chunk: Chunk) -> SockResult<()> {
        let slot = self.core.table.check(uuid)?;

        if !slot.writable_state() {
            return Err(SockError::Closed);
        }

        let first = {
            let mut io = slot.io.lock().unwrap();

            match *io {
                Some(SlotIo::Stream { ref mut queue, .. }) => {
                    let first = queue.is_empty();

                    if !queue.enqueue(chunk) {
                        return Err(SockError::Closed);
                    }
                    first
                }
                Some(SlotIo::Listener { .. }) => return Err(SockError::NotAttached),
                None => return Err(SockError::Closed)
            }
        };

        slot.touch(coarse_seconds());
        if first {
            self.push_task(Task::Flush(uuid));
        }
        Ok(())
    }

    /// Bytes sitting in the outgoing queue, not yet given to the kernel.
    pub fn pending(&self, uuid: Uuid) -> SockResult<usize> {
        let slot = self.core.table.check(uuid)?;
        let io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Stream { ref queue, .. }) => Ok(queue.pending()),
            _ => Err(SockError::Closed)
        }
    }

    /// Requests an orderly close: `on_shutdown`, a bounded drain of the
    /// queue, then exactly one `on_close`. Idempotent. Chunks enqueued
    /// after this call never reach the wire.
    pub fn close(&self, uuid: Uuid) -> SockResult<()> {
        let slot = self.core.table.check(uuid)?;

        if slot.transition(OPEN, CLOSING) {
            self.push_task(Task::Close(uuid));
        }
        Ok(())
    }

    /// Swaps the protocol attached to the connection; the replaced one
    /// receives its `on_close`. The swap itself is deferred to the
    /// reactor so it serialises with callbacks in flight.
    pub fn attach(&self, uuid: Uuid, protocol: Box<Protocol>) -> SockResult<()> {
        let slot = self.core.table.check(uuid)?;

        if slot.state() != OPEN {
            return Err(SockError::Closed);
        }
        self.push_task(Task::Attach(uuid, Some(protocol)));
        Ok(())
    }

    /// Schedules a task on the reactor threads, in submission order.
    pub fn defer(&self, task: Box<FnMut(&Runtime) + Send>) {
        self.push_task(Task::Fn(task));
    }

    /// Schedules a task bound to a connection: it runs under the
    /// connection lock, serialised with the protocol callbacks, and is
    /// dropped without running if the uuid goes stale first.
    pub fn defer_io(&self, uuid: Uuid, task: Box<FnMut(&Runtime, Uuid) + Send>) -> SockResult<()> {
        self.core.table.check(uuid)?;
        self.push_task(Task::DeferIo(uuid, Some(task)));
        Ok(())
    }

    /// Sets the inactivity timeout, in seconds; zero disables it. When
    /// it expires without traffic the protocol's `on_ping` runs.
    pub fn set_timeout(&self, uuid: Uuid, seconds: u8) -> SockResult<()> {
        let slot = self.core.table.check(uuid)?;

        slot.set_timeout(seconds);
        slot.touch(coarse_seconds());
        Ok(())
    }

    /// Marks the connection active, pushing its timeout back.
    pub fn touch(&self, uuid: Uuid) -> SockResult<()> {
        let slot = self.core.table.check(uuid)?;

        slot.touch(coarse_seconds());
        Ok(())
    }

    /// Registers a subscription; see [`Subscribe`](struct.Subscribe.html).
    pub fn subscribe(&self, args: Subscribe) -> SockResult<u64> {
        let owner = args.owner;

        if let Some(uuid) = owner {
            let slot = self.core.table.check(uuid)?;

            if slot.state() != OPEN {
                return Err(SockError::Closed);
            }
        }

        let channel = args.channel.clone();
        let pattern = args.matcher.is_some();
        let (id, change) = self.core.engine.subscribe(args);

        if let Some(uuid) = owner {
            let attached = self.core.table.check(uuid).ok().map(|slot| {
                let mut io = slot.io.lock().unwrap();

                match *io {
                    Some(SlotIo::Stream { ref mut subs, .. }) => {
                        subs.push(id);
                        true
                    }
                    _ => false
                }
            }).unwrap_or(false);

            if !attached {
                // lost the race against a close; undo quietly
                if let Some((entry, _, _, _)) = self.core.engine.unsubscribe(id) {
                    pubsub::retire(self, entry);
                }
                return Err(SockError::Closed);
            }
        }

        if change == RefChange::First {
            cluster::note_subscribe(self, &channel, pattern, true);
        }
        Ok(id)
    }

    /// Revokes a subscription by the handle `subscribe` returned.
    pub fn unsubscribe(&self, id: u64) {
        if let Some((entry, channel, pattern, change)) = self.core.engine.unsubscribe(id) {
            pubsub::retire(self, entry);
            if change == RefChange::Last {
                cluster::note_subscribe(self, &channel, pattern, false);
            }
        }
    }

    /// Publishes to every live subscriber, local and in sibling worker
    /// processes. Returns `WouldBlock` when the cluster bus is saturated
    /// instead of dropping; nothing has been delivered in that case.
    pub fn publish(&self, channel: &[u8], payload: &[u8], filter: u64) -> SockResult<()> {
        let msg = Arc::new(Message::new(channel.to_vec(), payload.to_vec(), filter, self.pid() as u32));

        cluster::forward_publish(self, &msg)?;
        self.core.engine.fanout(self, msg);
        Ok(())
    }

    /// Runs `task` every `interval`, `repetitions` times (zero meaning
    /// forever), then `on_finish`. Stopping the reactor cancels the
    /// timer but still runs `on_finish`.
    pub fn run_every(&self,
                     interval: Duration,
                     repetitions: usize,
                     task: Box<FnMut(&Runtime) + Send>,
                     on_finish: Option<Box<FnMut(&Runtime) + Send>>) {
        self.core.timers.schedule_every(interval, repetitions, task, on_finish);
        self.core.poller.wake();
    }

    /// Runs `task` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, task: Box<FnMut(&Runtime) + Send>) {
        self.core.timers.schedule_after(delay, task);
        self.core.poller.wake();
    }

    /// Runs the framework until [`stop`](#method.stop): forks workers
    /// when so configured, otherwise drives the reactor on the calling
    /// thread.
    pub fn run(&self) -> io::Result<()> {
        supervisor::run(self)
    }

    /// Asks every reactor thread (and, in the master, every worker
    /// process) to wind down. Callable from any thread.
    ///
    /// A master with live workers stops in order: shutdown frames go
    /// out on the bus first and the reactor keeps running until the
    /// workers are gone (or the join timeout escalates). Everywhere
    /// else the loop just winds down.
    pub fn stop(&self) {
        let orderly = {
            let cluster = self.core.cluster.lock().unwrap();

            !cluster.stopping && !cluster.links.is_empty()
        };

        if orderly && self.is_running() {
            supervisor::initiate_stop(self);
            return;
        }

        self.core.running.store(false, Ordering::Release);
        self.core.fifo.notify_all();
        self.core.poller.wake();
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    pub fn is_worker(&self) -> bool {
        self.core.is_worker.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> libc::pid_t {
        unsafe { libc::getpid() }
    }

    pub fn push_task(&self, task: Task) {
        self.core.fifo.push(task);
        self.core.poller.wake();
    }
}

pub fn coarse_seconds() -> usize {
    ::time::get_time().sec as usize
}
