// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The event loop.
///
/// One thread polls; the remaining threads of the pool drain the defer
/// FIFO. Each tick runs expired timers into the FIFO, processes a batch
/// of tasks, polls with a timeout bounded by the nearest timer, then
/// dispatches readiness with trylock-then-callback: a contended
/// connection is re-scheduled through the FIFO, never waited on.

use std::io;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use global::*;
use loop_msg::Task;
use poller::PollEvent;
use pubsub;
use runtime::{coarse_seconds, Runtime};
use slot_table::{SlotIo, OPEN, CLOSING, SHUTDOWN, DRAIN, FREE};
use timer::{now_ns, TimerEntry};
use write_queue::{Flush, WriteQueue};

// task batch bound per tick, keeps the loop fair under redefer storms
const TASK_BATCH: usize = 4096;
// poll timeout when nothing else is due
const IDLE_TICK_MS: u64 = 1000;

pub fn run(rt: &Runtime) -> io::Result<()> {
    let core = rt.core();

    core.running.store(true, Ordering::Release);
    arm_existing(rt);

    let mut helpers = Vec::new();

    for n in 1..core.config.thread_count() {
        let clone = rt.clone();
        let handle = thread::Builder::new()
            .name(format!("evio-{}", n))
            .spawn(move || helper_loop(&clone))?;

        helpers.push(handle);
    }

    let mut events: Vec<PollEvent> = Vec::with_capacity(1024);
    let mut last_sweep = coarse_seconds();

    while core.running.load(Ordering::Acquire) {
        tick(rt, &mut events, &mut last_sweep);
    }

    for handle in helpers {
        let _ = handle.join();
    }
    teardown(rt);
    Ok(())
}

fn tick(rt: &Runtime, events: &mut Vec<PollEvent>, last_sweep: &mut usize) {
    let core = rt.core();
    let mut expired: Vec<TimerEntry> = Vec::new();

    core.timers.pop_expired(now_ns(), &mut expired);
    for entry in expired {
        core.fifo.push(Task::Timer(entry));
    }

    for _ in 0..TASK_BATCH {
        match core.fifo.pop() {
            Some(task) => run_task(rt, task),
            None => break
        }
    }

    let timeout = if core.fifo.is_empty() {
        let idle = Duration::from_millis(IDLE_TICK_MS);

        match core.timers.next_delay(now_ns()) {
            Some(ns) => ::std::cmp::min(Duration::from_millis(ns / 1_000_000 + 1), idle),
            None => idle
        }
    } else {
        Duration::from_millis(0)
    };

    events.clear();
    if let Err(e) = core.poller.wait(events, Some(timeout)) {
        error!("poll failed: '{:?}'", e);
    }

    for n in 0..events.len() {
        let event = events[n];

        dispatch_event(rt, event);
    }

    let now = coarse_seconds();

    if now != *last_sweep {
        *last_sweep = now;
        sweep_timeouts(rt, now);
    }
}

pub fn helper_loop(rt: &Runtime) {
    while rt.is_running() {
        match rt.core().fifo.pop_wait(Duration::from_millis(100)) {
            Some(task) => run_task(rt, task),
            None => ()
        }
    }
}

pub fn run_task(rt: &Runtime, task: Task) {
    trace!("task: {}", task.name());
    match task {
        Task::Fn(mut f) => f(rt),
        Task::Event { uuid, readable, writable, errored } => {
            dispatch_uuid(rt, uuid, readable, writable, errored)
        }
        Task::Flush(uuid) => flush_task(rt, uuid),
        Task::Attach(uuid, mut proto) => attach_task(rt, uuid, proto.take()),
        Task::DeferIo(uuid, mut task) => defer_io_task(rt, uuid, task.take()),
        Task::Close(uuid) => close_sequence(rt, uuid),
        Task::Timer(entry) => timer_task(rt, entry),
        Task::Deliver { sub, seq, msg } => pubsub::deliver(rt, sub, seq, msg)
    }
}

fn dispatch_event(rt: &Runtime, event: PollEvent) {
    let gen = match rt.core().table.slot(event.fd) {
        Some(slot) if slot.state() != FREE => slot.gen(),
        _ => return
    };

    dispatch_uuid(rt,
                  Uuid::compose(event.fd, gen),
                  event.readable,
                  event.writable,
                  event.errored);
}

fn dispatch_uuid(rt: &Runtime, uuid: Uuid, readable: bool, writable: bool, errored: bool) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };

    // listener and pending-connect slots have no protocol to dispatch to
    let (is_listener, connecting) = {
        let io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Listener { .. }) => (true, false),
            Some(SlotIo::Stream { ref factory, .. }) => (false, factory.is_some()),
            None => return
        }
    };

    if is_listener {
        if errored {
            schedule_close(rt, uuid);
            return;
        }
        if readable {
            accept_loop(rt, uuid);
        }
        rearm(rt, uuid);
        return;
    }

    if connecting {
        if writable || errored {
            finish_connect(rt, uuid, errored);
        } else {
            rearm(rt, uuid);
        }
        return;
    }

    if errored {
        schedule_close(rt, uuid);
        return;
    }

    match slot.proto.try_lock() {
        Err(_) => {
            // contended: hand the event back to the FIFO, never block
            rt.push_task(Task::Event {
                uuid: uuid,
                readable: readable,
                writable: writable,
                errored: false
            });
        }
        Ok(mut guard) => {
            if readable {
                if let Some(protocol) = guard.as_mut() {
                    protocol.on_data(rt, uuid);
                }
            }
            if writable {
                flush_locked(rt, uuid, &mut guard);
            }
            drop(guard);
            rearm(rt, uuid);
        }
    }
}

fn flush_task(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };

    match slot.proto.try_lock() {
        Err(_) => rt.push_task(Task::Flush(uuid)),
        Ok(mut guard) => {
            flush_locked(rt, uuid, &mut guard);
            drop(guard);
            rearm(rt, uuid);
        }
    }
}

fn flush_locked(rt: &Runtime,
                uuid: Uuid,
                guard: &mut ::std::sync::MutexGuard<Option<Box<::protocol::Protocol>>>) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };
    let status = {
        let mut io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Stream { ref mut stream, ref mut queue, .. }) => queue.flush(&mut **stream),
            _ => return
        }
    };

    match status {
        Flush::Drained => {
            slot.touch(coarse_seconds());
            if let Some(protocol) = guard.as_mut() {
                protocol.on_ready(rt, uuid);
            }
        }
        Flush::WouldBlock => (),
        Flush::Closed | Flush::Error => schedule_close(rt, uuid)
    }
}

fn accept_loop(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();

    loop {
        let slot = match core.table.check(uuid) {
            Ok(slot) => slot,
            Err(_) => return
        };
        let accepted = {
            let mut io = slot.io.lock().unwrap();

            match *io {
                Some(SlotIo::Listener { ref mut listener, .. }) => listener.accept(),
                _ => return
            }
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("[{:?}] accepted connection from {}", uuid, addr);
                on_accepted(rt, uuid, stream);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // transient exhaustion must not take the listener down
                error!("[{:?}] accept failed: '{:?}'", uuid, e);
                break;
            }
        }
    }
}

fn on_accepted(rt: &Runtime, listener_uuid: Uuid, stream: ::mio::net::TcpStream) {
    use std::os::unix::io::AsRawFd;

    let core = rt.core();
    let fd = stream.as_raw_fd();
    let io = SlotIo::Stream {
        stream: Box::new(stream),
        queue: WriteQueue::new(),
        factory: None,
        subs: Vec::new()
    };
    let uuid = match core.table.claim(fd, io, 0, coarse_seconds()) {
        Ok(uuid) => uuid,
        Err(e) => {
            error!("[{:?}] no slot for accepted connection: '{:?}'", listener_uuid, e);
            return;
        }
    };
    let protocol = {
        let listener_slot = match core.table.check(listener_uuid) {
            Ok(slot) => slot,
            Err(_) => {
                free_silently(rt, uuid);
                return;
            }
        };
        let mut io = listener_slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Listener { ref mut factory, .. }) => factory.on_open(rt, uuid),
            _ => None
        }
    };

    match protocol {
        Some(protocol) => {
            if let Ok(slot) = core.table.check(uuid) {
                *slot.proto.lock().unwrap() = Some(protocol);
            }
            rearm(rt, uuid);
        }
        None => free_silently(rt, uuid)
    }
}

fn finish_connect(rt: &Runtime, uuid: Uuid, errored: bool) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };
    let (factory, failure) = {
        let mut io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Stream { ref mut factory, ref stream, .. }) => {
                let factory = match factory.take() {
                    Some(factory) => factory,
                    None => return
                };
                let failure = match stream.take_error() {
                    Ok(Some(e)) => Some(e),
                    Ok(None) if errored => Some(other_io_error("connection failed")),
                    Ok(None) => None,
                    Err(e) => Some(e)
                };

                (factory, failure)
            }
            _ => return
        }
    };
    let mut factory = factory;

    match failure {
        None => {
            debug!("[{:?}] connected", uuid);
            match factory.on_open(rt, uuid) {
                Some(protocol) => {
                    *slot.proto.lock().unwrap() = Some(protocol);
                    rearm(rt, uuid);
                }
                None => free_silently(rt, uuid)
            }
        }
        Some(err) => {
            debug!("[{:?}] connect failed: '{:?}'", uuid, err);
            factory.on_fail(rt, err);
            free_silently(rt, uuid);
        }
    }
}

fn attach_task(rt: &Runtime, uuid: Uuid, protocol: Option<Box<::protocol::Protocol>>) {
    let mut protocol = match protocol {
        Some(protocol) => protocol,
        None => return
    };
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) if slot.state() == OPEN => slot,
        _ => {
            // never attached; still give the owner its release signal
            protocol.on_close(rt, uuid);
            return;
        }
    };

    match slot.proto.try_lock() {
        Err(_) => rt.push_task(Task::Attach(uuid, Some(protocol))),
        Ok(mut guard) => {
            if core.table.check(uuid).is_err() || slot.state() != OPEN {
                drop(guard);
                protocol.on_close(rt, uuid);
                return;
            }

            let previous = guard.take();

            *guard = Some(protocol);
            drop(guard);
            if let Some(mut previous) = previous {
                previous.on_close(rt, uuid);
            }
            rearm(rt, uuid);
        }
    }
}

/// Runs a connection-bound deferred task under the connection lock, so
/// it serialises with the protocol callbacks. Dropped silently when the
/// uuid went stale first.
fn defer_io_task(rt: &Runtime, uuid: Uuid, task: Option<Box<FnMut(&Runtime, Uuid) + Send>>) {
    let mut task = match task {
        Some(task) => task,
        None => return
    };
    let slot = match rt.core().table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };

    match slot.proto.try_lock() {
        Err(_) => rt.push_task(Task::DeferIo(uuid, Some(task))),
        Ok(guard) => {
            if rt.core().table.check(uuid).is_ok() {
                task(rt, uuid);
            }
            drop(guard);
        }
    }
}

/// Queues the orderly close of a connection.
pub fn schedule_close(rt: &Runtime, uuid: Uuid) {
    let state = match rt.core().table.check(uuid) {
        Ok(slot) => slot.state(),
        Err(_) => return
    };

    if state == OPEN || state == CLOSING {
        rt.push_task(Task::Close(uuid));
    }
}

/// `on_shutdown`, one grace drain of the queue, `on_close`, then the
/// generation moves and the descriptor is released.
fn close_sequence(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };
    let state = slot.state();

    if state != OPEN && state != CLOSING {
        return;
    }

    let is_listener = {
        let io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Listener { .. }) => true,
            Some(SlotIo::Stream { .. }) => false,
            None => return
        }
    };

    if is_listener {
        close_listener(rt, uuid);
        return;
    }

    let mut guard = match slot.proto.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            rt.push_task(Task::Close(uuid));
            return;
        }
    };

    // the close may have finished on another thread while this task
    // waited for the connection lock
    if core.table.check(uuid).is_err() {
        return;
    }
    if !slot.transition(OPEN, SHUTDOWN) && !slot.transition(CLOSING, SHUTDOWN) {
        return;
    }

    debug!("[{:?}] closing", uuid);
    if let Some(protocol) = guard.as_mut() {
        protocol.on_shutdown(rt, uuid);
    }
    slot.set_state(DRAIN);

    {
        let mut io = slot.io.lock().unwrap();

        if let Some(SlotIo::Stream { ref mut stream, ref mut queue, .. }) = *io {
            queue.seal();
            let _ = queue.flush(&mut **stream);
        }
    }

    core.poller.forget(uuid.fd());

    let mut io_taken = slot.io.lock().unwrap().take();
    let mut pending_factory = None;
    let mut conn_subs = Vec::new();

    if let Some(SlotIo::Stream { ref mut factory, ref subs, .. }) = io_taken {
        pending_factory = factory.take();
        conn_subs = subs.clone();
    }
    for id in conn_subs {
        rt.unsubscribe(id);
    }

    let protocol = guard.take();

    if let Some(mut protocol) = protocol {
        protocol.on_close(rt, uuid);
    }
    if let Some(mut factory) = pending_factory {
        factory.on_fail(rt, other_io_error("closed before the connect completed"));
    }

    slot.bump_gen();
    slot.set_state(FREE);
    drop(io_taken);
    drop(guard);
}

fn close_listener(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };

    if !slot.transition(OPEN, DRAIN) && !slot.transition(CLOSING, DRAIN) {
        return;
    }

    debug!("[{:?}] listener closing", uuid);
    core.poller.forget(uuid.fd());

    let io_taken = slot.io.lock().unwrap().take();

    slot.bump_gen();
    slot.set_state(FREE);

    if let Some(SlotIo::Listener { listener, factory }) = io_taken {
        let mut factory = factory;

        drop(listener);
        factory.on_finish(rt);
    }
}

/// Releases a slot that never carried a protocol: rejected accepts and
/// failed connects.
fn free_silently(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };
    let mut guard = slot.proto.lock().unwrap();

    if core.table.check(uuid).is_err() {
        return;
    }
    if !slot.transition(OPEN, DRAIN) && !slot.transition(CLOSING, DRAIN) {
        return;
    }

    core.poller.forget(uuid.fd());

    let io_taken = slot.io.lock().unwrap().take();

    if let Some(SlotIo::Stream { ref subs, .. }) = io_taken {
        for &id in subs.iter() {
            rt.unsubscribe(id);
        }
    }

    *guard = None;
    slot.bump_gen();
    slot.set_state(FREE);
    drop(io_taken);
    drop(guard);
}

/// Re-arms one-shot interest after a delivery: reads while the slot is
/// open, writes while the queue holds bytes or a connect is in flight.
fn rearm(rt: &Runtime, uuid: Uuid) {
    let core = rt.core();
    let slot = match core.table.check(uuid) {
        Ok(slot) => slot,
        Err(_) => return
    };

    if slot.state() != OPEN {
        return;
    }

    let (read, write) = {
        let io = slot.io.lock().unwrap();

        match *io {
            Some(SlotIo::Listener { .. }) => {
                (core.accepting.load(Ordering::Acquire), false)
            }
            Some(SlotIo::Stream { ref queue, ref factory, .. }) => {
                (factory.is_none(), !queue.is_empty() || factory.is_some())
            }
            None => return
        }
    };

    if read || write {
        if let Err(e) = core.poller.monitor(uuid.fd(), read, write) {
            error!("[{:?}] monitor failed: '{:?}'", uuid, e);
            schedule_close(rt, uuid);
        }
    }
}

fn arm_existing(rt: &Runtime) {
    let core = rt.core();

    for fd in 0..core.table.max_fd() + 1 {
        let gen = match core.table.slot(fd as i32) {
            Some(slot) if slot.state() == OPEN => slot.gen(),
            _ => continue
        };

        rearm(rt, Uuid::compose(fd as i32, gen));
    }
}

fn sweep_timeouts(rt: &Runtime, now: usize) {
    let core = rt.core();

    for fd in 0..core.table.max_fd() + 1 {
        let slot = match core.table.slot(fd as i32) {
            Some(slot) => slot,
            None => continue
        };

        if slot.state() != OPEN {
            continue;
        }

        let timeout = slot.timeout();

        if timeout == 0 || now.saturating_sub(slot.active_at()) < timeout {
            continue;
        }

        let uuid = Uuid::compose(fd as i32, slot.gen());

        if let Ok(mut guard) = slot.proto.try_lock() {
            slot.touch(now);
            if let Some(protocol) = guard.as_mut() {
                debug!("[{:?}] timed out", uuid);
                protocol.on_ping(rt, uuid);
            }
        }
    }
}

fn timer_task(rt: &Runtime, entry: TimerEntry) {
    let TimerEntry { deadline, interval, repetitions, mut task, on_finish } = entry;

    task(rt);

    if !rt.is_running() {
        if let Some(mut finish) = on_finish {
            finish(rt);
        }
        return;
    }

    match repetitions {
        1 => {
            if let Some(mut finish) = on_finish {
                finish(rt);
            }
        }
        n => {
            rt.core().timers.push(TimerEntry {
                deadline: deadline + interval,
                interval: interval,
                repetitions: if n == 0 { 0 } else { n - 1 },
                task: task,
                on_finish: on_finish
            });
        }
    }
}

fn teardown(rt: &Runtime) {
    let core = rt.core();

    for _ in 0..TASK_BATCH {
        match core.fifo.pop() {
            Some(task) => run_task(rt, task),
            None => break
        }
    }

    for fd in 0..core.table.max_fd() + 1 {
        let gen = match core.table.slot(fd as i32) {
            Some(slot) if slot.state() == OPEN || slot.state() == CLOSING => slot.gen(),
            _ => continue
        };

        close_sequence(rt, Uuid::compose(fd as i32, gen));
    }

    for entry in core.timers.drain() {
        if let Some(mut finish) = entry.on_finish {
            finish(rt);
        }
    }

    for _ in 0..TASK_BATCH {
        match core.fifo.pop() {
            Some(Task::Fn(mut f)) => f(rt),
            Some(Task::Close(uuid)) => close_sequence(rt, uuid),
            Some(_) => (),
            None => break
        }
    }
}
