// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::sync::{Arc, Mutex};

use global::Uuid;
use protocol::Protocol;
use pubsub::{Message, SubEntry};
use runtime::Runtime;
use timer::TimerEntry;

/// Work items flowing through the defer FIFO so components can hand
/// execution to the reactor threads.
pub enum Task {
    /// A user task scheduled through `defer`.
    Fn(Box<FnMut(&Runtime) + Send>),
    /// Readiness that could not be dispatched because the connection
    /// lock was contended.
    Event {
        uuid: Uuid,
        readable: bool,
        writable: bool,
        errored: bool
    },
    /// Drain the outgoing queue of a connection.
    Flush(Uuid),
    /// Swap the protocol attached to a connection.
    Attach(Uuid, Option<Box<Protocol>>),
    /// A user task bound to a connection, run under its lock.
    DeferIo(Uuid, Option<Box<FnMut(&Runtime, Uuid) + Send>>),
    /// Run the orderly close sequence of a connection.
    Close(Uuid),
    /// An expired timer ready to run.
    Timer(TimerEntry),
    /// Hand one publication to one subscription.
    Deliver {
        sub: Arc<Mutex<SubEntry>>,
        seq: u64,
        msg: Arc<Message>
    }
}

impl Task {
    pub fn name(&self) -> &'static str {
        match *self {
            Task::Fn(_)          => "Fn",
            Task::Event { .. }   => "Event",
            Task::Flush(_)       => "Flush",
            Task::Attach(_, _)   => "Attach",
            Task::DeferIo(_, _)  => "DeferIo",
            Task::Close(_)       => "Close",
            Task::Timer(_)       => "Timer",
            Task::Deliver { .. } => "Deliver"
        }
    }
}
