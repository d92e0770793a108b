// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Evented TCP/HTTP/WebSocket server framework.
//!
//! A single-threaded reactor drives non-blocking sockets through
//! per-connection protocol callbacks; extra threads drain deferred
//! tasks, extra processes scale the whole server across cores, and a
//! built-in pub/sub engine fans messages out across all of them over a
//! framed cluster bus. Connections are addressed by a [`Uuid`](struct.Uuid.html)
//! that goes stale the moment the connection dies, so late callbacks
//! fail cleanly instead of touching a recycled descriptor.
//!
//! ```no_run
//! use evio::{Config, Factory, Protocol, Runtime, SockError, Uuid};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
//!         let mut buf = [0u8; 4096];
//!
//!         loop {
//!             match rt.read(uuid, &mut buf) {
//!                 Ok(n) => { let _ = rt.write(uuid, buf[..n].to_vec()); }
//!                 Err(SockError::WouldBlock) => break,
//!                 Err(_) => { let _ = rt.close(uuid); break; }
//!             }
//!         }
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl Factory for EchoFactory {
//!     fn on_open(&mut self, _rt: &Runtime, _uuid: Uuid) -> Option<Box<Protocol>> {
//!         Some(Box::new(Echo))
//!     }
//! }
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//!
//! rt.listen("127.0.0.1:3000", Box::new(EchoFactory)).unwrap();
//! rt.run().unwrap();
//! ```

#[macro_use]
extern crate log;
extern crate base64;
extern crate byteorder;
extern crate httparse;
extern crate iovec;
extern crate libc;
extern crate mio;
extern crate mio_uds;
extern crate rand;
extern crate sha1;
extern crate time;

mod global;
mod config;
mod transport;
mod poller;
mod slot_table;
mod write_queue;
mod protocol;
mod loop_msg;
mod timer;
mod reactor;
mod runtime;
mod supervisor;
mod cluster;
mod pubsub;

pub mod http;
pub mod ws;

pub use cluster::{Bridge, Frame, FrameCodec, FrameType, set_bridge};
pub use config::Config;
pub use global::{SockError, SockResult, Uuid};
pub use protocol::{Factory, Protocol};
pub use pubsub::{glob_match, MatchFn, Message, Subscribe};
pub use runtime::Runtime;
pub use transport::Transport;
pub use write_queue::Chunk;
