// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The master process: forks workers, reaps and respawns them, and
/// winds the cluster down in order (bus shutdown frame, then SIGTERM,
/// then SIGKILL). With zero workers the reactor simply runs in the
/// calling process and none of the process machinery engages.

use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering, ATOMIC_BOOL_INIT, ATOMIC_ISIZE_INIT};
use std::thread;
use std::time::Duration;

use libc;

use mio_uds::UnixStream;

use cluster;
use poller;
use reactor;
use runtime::Runtime;
use slot_table::{SlotIo, FREE};

const RESPAWN_DELAY_MS: u64 = 250;

static SIG_STOP: AtomicBool = ATOMIC_BOOL_INIT;
static SIG_CHLD: AtomicBool = ATOMIC_BOOL_INIT;
static WAKE_FD: AtomicIsize = ATOMIC_ISIZE_INIT;

extern "C" fn on_stop_signal(_: libc::c_int) {
    SIG_STOP.store(true, Ordering::Release);
    let fd = WAKE_FD.load(Ordering::Acquire);

    if fd > 0 {
        poller::wake_fd(fd as libc::c_int);
    }
}

extern "C" fn on_chld_signal(_: libc::c_int) {
    SIG_CHLD.store(true, Ordering::Release);
    let fd = WAKE_FD.load(Ordering::Acquire);

    if fd > 0 {
        poller::wake_fd(fd as libc::c_int);
    }
}

pub fn run(rt: &Runtime) -> io::Result<()> {
    ignore_sigpipe();

    let workers = rt.core().config.worker_count();

    if workers == 0 {
        return reactor::run(rt);
    }

    // accepting is the workers' job from here on
    rt.core().accepting.store(false, Ordering::Release);
    WAKE_FD.store(rt.core().poller.wake_handle() as isize, Ordering::Release);
    install_signal_handlers();

    info!("master {}: forking {} worker(s)", rt.pid(), workers);
    for _ in 0..workers {
        spawn_worker(rt)?;
    }

    rt.core().timers.schedule_every(Duration::from_millis(100),
                                    0,
                                    Box::new(|rt: &Runtime| supervise(rt)),
                                    None);
    rt.core().timers.schedule_every(Duration::from_secs(30),
                                    0,
                                    Box::new(|rt: &Runtime| cluster::ping_workers(rt)),
                                    None);

    let result = reactor::run(rt);

    reap_stragglers(rt);
    result
}

fn spawn_worker(rt: &Runtime) -> io::Result<()> {
    let (master_end, worker_end) = UnixStream::pair()?;

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            drop(master_end);
            worker_process(rt, worker_end)
        }
        pid => {
            drop(worker_end);
            cluster::attach_master_link(rt, master_end, pid)?;
            info!("master {}: worker {} up", rt.pid(), pid);
            Ok(())
        }
    }
}

fn worker_process(rt: &Runtime, stream: UnixStream) -> ! {
    let core = rt.core();

    core.is_worker.store(true, Ordering::Release);
    core.accepting.store(true, Ordering::Release);
    reset_signal_handlers();

    // nothing scheduled in the parent belongs to this process
    core.fifo.clear();
    core.timers.clear();
    {
        let mut cluster = core.cluster.lock().unwrap();

        cluster.links.clear();
        cluster.refs.clear();
        cluster.bridge = None;
        cluster.stopping = false;
    }

    if let Err(e) = core.poller.reopen() {
        error!("worker {}: poller reopen failed: '{:?}'", rt.pid(), e);
        process::exit(1);
    }
    purge_inherited(rt);

    if let Err(e) = cluster::attach_worker_upstream(rt, stream) {
        error!("worker {}: bus attach failed: '{:?}'", rt.pid(), e);
        process::exit(1);
    }

    let code = match reactor::run(rt) {
        Ok(_) => if cluster::upstream_lost(rt) { 1 } else { 0 },
        Err(e) => {
            error!("worker {}: reactor failed: '{:?}'", rt.pid(), e);
            1
        }
    };

    process::exit(code)
}

/// Drops every inherited connection slot except the listeners, which a
/// worker shares with its siblings.
fn purge_inherited(rt: &Runtime) {
    let core = rt.core();

    for fd in 0..core.table.max_fd() + 1 {
        let slot = match core.table.slot(fd as i32) {
            Some(slot) => slot,
            None => continue
        };

        if slot.state() == FREE {
            continue;
        }

        let keep = {
            let io = slot.io.lock().unwrap();

            match *io {
                Some(SlotIo::Listener { .. }) => true,
                _ => false
            }
        };

        if keep {
            continue;
        }

        *slot.proto.lock().unwrap() = None;

        let taken = slot.io.lock().unwrap().take();

        slot.bump_gen();
        slot.set_state(FREE);
        drop(taken);
    }
}

fn supervise(rt: &Runtime) {
    if SIG_CHLD.swap(false, Ordering::AcqRel) {
        reap(rt);
    }
    if SIG_STOP.swap(false, Ordering::AcqRel) {
        initiate_stop(rt);
    }
}

fn reap(rt: &Runtime) {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

        if pid <= 0 {
            break;
        }

        let clean = unsafe { libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 };
        let link = {
            let mut cluster = rt.core().cluster.lock().unwrap();
            let position = cluster.links.iter().position(|l| l.pid == pid);

            position.map(|i| cluster.links.remove(i))
        };

        if let Some(link) = link {
            let _ = rt.close(link.uuid);
        }

        let stopping = rt.core().cluster.lock().unwrap().stopping;

        if stopping || clean {
            info!("worker {} exited", pid);
            continue;
        }

        warn!("worker {} died, respawning in {}ms", pid, RESPAWN_DELAY_MS);
        rt.run_after(Duration::from_millis(RESPAWN_DELAY_MS), Box::new(|rt: &Runtime| {
            let stopping = rt.core().cluster.lock().unwrap().stopping;

            if rt.is_running() && !stopping {
                if let Err(e) = spawn_worker(rt) {
                    error!("respawn failed: '{:?}'", e);
                }
            }
        }));
    }
}

/// Orderly cluster stop: shutdown frames first, the heavy hand later.
pub fn initiate_stop(rt: &Runtime) {
    {
        let cluster = rt.core().cluster.lock().unwrap();

        if cluster.stopping {
            return;
        }
    }

    info!("master {}: stopping", rt.pid());
    cluster::broadcast_shutdown(rt);

    let grace = rt.core().config.join_timeout_ms;

    rt.run_after(Duration::from_millis(grace), Box::new(|rt: &Runtime| {
        signal_workers(rt, libc::SIGTERM);
    }));
    rt.run_after(Duration::from_millis(grace + 2_000), Box::new(|rt: &Runtime| {
        signal_workers(rt, libc::SIGKILL);
        rt.stop();
    }));
}

fn signal_workers(rt: &Runtime, signal: libc::c_int) {
    let pids: Vec<libc::pid_t> = {
        let cluster = rt.core().cluster.lock().unwrap();

        cluster.links.iter().map(|l| l.pid).filter(|&p| p > 0).collect()
    };

    for pid in pids {
        warn!("worker {} still up, sending signal {}", pid, signal);
        unsafe { libc::kill(pid, signal) };
    }
}

/// Post-reactor cleanup in the master: whoever is still alive gets the
/// escalation treatment, then everyone is reaped.
fn reap_stragglers(rt: &Runtime) {
    let grace = rt.core().config.join_timeout_ms;
    let steps = grace / 50 + 1;

    for _ in 0..steps {
        if !has_children() {
            return;
        }
        reap_nohang();
        thread::sleep(Duration::from_millis(50));
    }

    signal_workers(rt, libc::SIGTERM);
    thread::sleep(Duration::from_millis(200));
    reap_nohang();

    if has_children() {
        signal_workers(rt, libc::SIGKILL);
        loop {
            let pid = unsafe { libc::waitpid(-1, ::std::ptr::null_mut(), 0) };

            if pid <= 0 {
                break;
            }
        }
    }
}

fn reap_nohang() {
    loop {
        let pid = unsafe { libc::waitpid(-1, ::std::ptr::null_mut(), libc::WNOHANG) };

        if pid <= 0 {
            break;
        }
    }
}

fn has_children() -> bool {
    let pid = unsafe { libc::waitpid(-1, ::std::ptr::null_mut(), libc::WNOHANG) };

    pid >= 0
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn install_signal_handlers() {
    unsafe {
        let stop: extern "C" fn(libc::c_int) = on_stop_signal;
        let chld: extern "C" fn(libc::c_int) = on_chld_signal;

        libc::signal(libc::SIGINT, stop as libc::sighandler_t);
        libc::signal(libc::SIGTERM, stop as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, chld as libc::sighandler_t);
    }
}

fn reset_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    }
}
