// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;

use global::Uuid;
use runtime::Runtime;

/// Per-connection callbacks.
///
/// Exactly one protocol is attached to a connection at a time and at
/// most one of its callbacks is in flight: the reactor acquires the
/// connection lock before dispatching and re-schedules on contention
/// instead of blocking. Callbacks must not block either; long work
/// belongs on [`Runtime::defer`](struct.Runtime.html#method.defer).
///
/// `on_close` runs exactly once, after the last `on_data`, and is the
/// signal to release whatever the protocol owns.
pub trait Protocol : Send {
    /// The connection has bytes to read.
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid);

    /// The outgoing queue just drained.
    fn on_ready(&mut self, _rt: &Runtime, _uuid: Uuid) {
    }

    /// The connection is going away; last chance to enqueue a goodbye.
    fn on_shutdown(&mut self, _rt: &Runtime, _uuid: Uuid) {
    }

    /// The uuid is dead. No further callback will fire for it.
    fn on_close(&mut self, _rt: &Runtime, _uuid: Uuid) {
    }

    /// The connection timeout expired without traffic.
    fn on_ping(&mut self, rt: &Runtime, uuid: Uuid) {
        let _ = rt.close(uuid);
    }
}

/// Builds protocols for accepted or established connections.
pub trait Factory : Send {
    /// A connection is up. Returning `None` rejects it.
    fn on_open(&mut self, rt: &Runtime, uuid: Uuid) -> Option<Box<Protocol>>;

    /// An outbound connection attempt failed.
    fn on_fail(&mut self, _rt: &Runtime, _err: io::Error) {
    }

    /// The owning listener shut down.
    fn on_finish(&mut self, _rt: &Runtime) {
    }
}
