// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use libc;

/// Startup options consumed by [`Runtime::new`](struct.Runtime.html#method.new).
#[derive(Clone)]
pub struct Config {
    /// Number of worker processes to fork. Zero runs the reactor in the
    /// calling process, a negative value auto-detects the CPU count.
    pub workers: i32,
    /// Threads per reactor: one polls, the others drain deferred tasks.
    /// Values below one are treated as one.
    pub threads: i32,
    /// Use the portable `poll(2)` readiness backend instead of the
    /// platform edge-triggered one.
    pub portable_poll: bool,
    /// Upper bound on the connection table. Zero sizes the table from
    /// `RLIMIT_NOFILE`.
    pub capacity: usize,
    /// Largest cluster-bus frame accepted before the connection is
    /// declared corrupt.
    pub max_frame_size: usize,
    /// Bytes queued on the cluster socket before `publish` reports
    /// `WouldBlock` to the caller.
    pub bus_highwater: usize,
    /// Grace given to worker processes between the shutdown broadcast
    /// and SIGTERM, in milliseconds.
    pub join_timeout_ms: u64
}

impl Default for Config {
    fn default() -> Config {
        Config {
            workers: 0,
            threads: 1,
            portable_poll: false,
            capacity: 0,
            max_frame_size: 256 * 1024 * 1024,
            bus_highwater: 8 * 1024 * 1024,
            join_timeout_ms: 5_000
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        if self.workers < 0 {
            cpu_count()
        } else {
            self.workers as usize
        }
    }

    pub fn thread_count(&self) -> usize {
        if self.threads < 1 {
            1
        } else {
            self.threads as usize
        }
    }
}

pub fn cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };

    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_workers_autodetect() {
        let mut config = Config::default();

        config.workers = -1;
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn threads_are_at_least_one() {
        let mut config = Config::default();

        config.threads = -4;
        assert_eq!(1, config.thread_count());
        config.threads = 3;
        assert_eq!(3, config.thread_count());
    }
}
