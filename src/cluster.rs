// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The master/worker message bus.
///
/// Frames are length-prefixed and big-endian throughout:
///
/// ```text
/// magic(4) type(1) flags(1) channel_len(2) payload_len(4) filter(8)
/// channel bytes, payload bytes
/// ```
///
/// A worker forwards subscribe/unsubscribe/publish frames upstream; the
/// master relays each publication to every other worker, so combined
/// with local delivery at publish time every subscriber in the cluster
/// sees a publication exactly once. A frame that fails validation is
/// corruption, fatal to the worker that saw it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use libc;

use mio_uds::UnixStream;

use global::*;
use protocol::Protocol;
use pubsub::Message;
use runtime::Runtime;
use slot_table::SlotIo;
use write_queue::WriteQueue;

pub const FRAME_MAGIC: u32 = 0xF1AC_1010;
pub const HEADER_LEN: usize = 20;

pub const FLAG_PATTERN: u8 = 0x01;
pub const FLAG_FILTER: u8 = 0x02;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameType {
    Subscribe = 1,
    Unsubscribe = 2,
    Publish = 3,
    Ping = 4,
    Shutdown = 5,
    Identify = 6
}

impl FrameType {
    fn from_u8(byte: u8) -> Option<FrameType> {
        match byte {
            1 => Some(FrameType::Subscribe),
            2 => Some(FrameType::Unsubscribe),
            3 => Some(FrameType::Publish),
            4 => Some(FrameType::Ping),
            5 => Some(FrameType::Shutdown),
            6 => Some(FrameType::Identify),
            _ => None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub ftype: FrameType,
    pub flags: u8,
    pub filter: u64,
    pub channel: Vec<u8>,
    pub payload: Vec<u8>
}

impl Frame {
    pub fn publish(channel: &[u8], payload: &[u8], filter: u64) -> Frame {
        Frame {
            ftype: FrameType::Publish,
            flags: if filter != 0 { FLAG_FILTER } else { 0 },
            filter: filter,
            channel: channel.to_vec(),
            payload: payload.to_vec()
        }
    }

    pub fn subscription(channel: &[u8], pattern: bool, subscribe: bool) -> Frame {
        Frame {
            ftype: if subscribe { FrameType::Subscribe } else { FrameType::Unsubscribe },
            flags: if pattern { FLAG_PATTERN } else { 0 },
            filter: 0,
            channel: channel.to_vec(),
            payload: Vec::new()
        }
    }

    pub fn ping() -> Frame {
        Frame { ftype: FrameType::Ping, flags: 0, filter: 0, channel: Vec::new(), payload: Vec::new() }
    }

    pub fn shutdown() -> Frame {
        Frame { ftype: FrameType::Shutdown, flags: 0, filter: 0, channel: Vec::new(), payload: Vec::new() }
    }

    pub fn identify(pid: libc::pid_t) -> Frame {
        let mut payload = vec![0u8; 4];

        BigEndian::write_u32(&mut payload, pid as u32);
        Frame { ftype: FrameType::Identify, flags: 0, filter: 0, channel: Vec::new(), payload: payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];

        BigEndian::write_u32(&mut buf[0..4], FRAME_MAGIC);
        buf[4] = self.ftype as u8;
        buf[5] = self.flags;
        BigEndian::write_u16(&mut buf[6..8], self.channel.len() as u16);
        BigEndian::write_u32(&mut buf[8..12], self.payload.len() as u32);
        BigEndian::write_u64(&mut buf[12..20], self.filter);
        buf.extend_from_slice(&self.channel);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Incremental frame reader over the byte stream.
pub struct FrameCodec {
    buf: Vec<u8>,
    limit: usize
}

impl FrameCodec {
    pub fn new(limit: usize) -> FrameCodec {
        FrameCodec { buf: Vec::new(), limit: limit }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete frame, `None` while bytes are missing, an
    /// error on corruption.
    pub fn next(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if BigEndian::read_u32(&self.buf[0..4]) != FRAME_MAGIC {
            return Err(invalid_data_io_error("bad frame magic on the bus"));
        }

        let ftype = match FrameType::from_u8(self.buf[4]) {
            Some(ftype) => ftype,
            None => return Err(invalid_data_io_error("unknown frame type on the bus"))
        };
        let flags = self.buf[5];
        let channel_len = BigEndian::read_u16(&self.buf[6..8]) as usize;
        let payload_len = BigEndian::read_u32(&self.buf[8..12]) as usize;

        if channel_len + payload_len > self.limit {
            return Err(invalid_data_io_error("oversized frame on the bus"));
        }

        let total = HEADER_LEN + channel_len + payload_len;

        if self.buf.len() < total {
            return Ok(None);
        }

        let filter = BigEndian::read_u64(&self.buf[12..20]);
        let channel = self.buf[HEADER_LEN..HEADER_LEN + channel_len].to_vec();
        let payload = self.buf[HEADER_LEN + channel_len..total].to_vec();

        self.buf.drain(..total);

        Ok(Some(Frame {
            ftype: ftype,
            flags: flags,
            filter: filter,
            channel: channel,
            payload: payload
        }))
    }
}

pub struct WorkerLink {
    pub uuid: Uuid,
    pub pid: libc::pid_t
}

pub struct ClusterState {
    /// Worker side: the connection to the master.
    pub upstream: Option<Uuid>,
    /// Set when the upstream vanished underneath a live worker.
    pub upstream_lost: bool,
    /// Master side: one link per live worker.
    pub links: Vec<WorkerLink>,
    /// Master side: cluster-wide subscription reference counts, feeding
    /// the external bridge when one is installed.
    pub refs: HashMap<(Vec<u8>, bool), usize>,
    pub bridge: Option<Box<Bridge>>,
    /// The master is winding its workers down.
    pub stopping: bool
}

impl ClusterState {
    pub fn new() -> ClusterState {
        ClusterState {
            upstream: None,
            upstream_lost: false,
            links: Vec::new(),
            refs: HashMap::new(),
            bridge: None,
            stopping: false
        }
    }
}

/// An external pub/sub service the master mirrors subscriptions into.
pub trait Bridge : Send {
    fn subscribe(&mut self, channel: &[u8], pattern: bool);
    fn unsubscribe(&mut self, channel: &[u8], pattern: bool);
    fn publish(&mut self, channel: &[u8], payload: &[u8], filter: u64);
    fn reconnect(&mut self);
}

/// Installs the bridge; master side only.
pub fn set_bridge(rt: &Runtime, bridge: Box<Bridge>) {
    rt.core().cluster.lock().unwrap().bridge = Some(bridge);
}

/// Claims a slot for the master's end of a worker socketpair.
pub fn attach_master_link(rt: &Runtime, stream: UnixStream, pid: libc::pid_t) -> io::Result<Uuid> {
    let uuid = claim_bus_stream(rt, stream)?;
    let protocol = MasterLink {
        uuid: uuid,
        codec: FrameCodec::new(rt.core().config.max_frame_size),
        refs: HashSet::new()
    };

    if let Ok(slot) = rt.core().table.check(uuid) {
        *slot.proto.lock().unwrap() = Some(Box::new(protocol));
    }
    rt.core().cluster.lock().unwrap().links.push(WorkerLink { uuid: uuid, pid: pid });

    if rt.is_running() {
        rt.core().poller.monitor(uuid.fd(), true, false)?;
    }
    Ok(uuid)
}

/// Claims a slot for a worker's end of the socketpair and introduces
/// the worker to the master.
pub fn attach_worker_upstream(rt: &Runtime, stream: UnixStream) -> io::Result<Uuid> {
    let uuid = claim_bus_stream(rt, stream)?;
    let protocol = UpstreamLink { codec: FrameCodec::new(rt.core().config.max_frame_size) };

    if let Ok(slot) = rt.core().table.check(uuid) {
        *slot.proto.lock().unwrap() = Some(Box::new(protocol));
    }
    rt.core().cluster.lock().unwrap().upstream = Some(uuid);

    rt.write(uuid, Frame::identify(rt.pid()).encode())
        .map_err(|e| other_io_error(e.name()))?;
    Ok(uuid)
}

fn claim_bus_stream(rt: &Runtime, stream: UnixStream) -> io::Result<Uuid> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let io = SlotIo::Stream {
        stream: Box::new(stream),
        queue: WriteQueue::new(),
        factory: None,
        subs: Vec::new()
    };

    match rt.core().table.claim(fd, io, 0, ::runtime::coarse_seconds()) {
        Ok(uuid) => Ok(uuid),
        Err(SockError::Io(e)) => Err(e),
        Err(e) => Err(other_io_error(e.name()))
    }
}

/// Forwards a local publication across the process boundary. In a
/// worker this is where bus backpressure surfaces: a saturated bus
/// queue turns into `WouldBlock` before anything was delivered.
pub fn forward_publish(rt: &Runtime, msg: &Arc<Message>) -> SockResult<()> {
    let core = rt.core();
    let upstream = core.cluster.lock().unwrap().upstream;

    if let Some(uuid) = upstream {
        if rt.pending(uuid)? >= core.config.bus_highwater {
            return Err(SockError::WouldBlock);
        }
        return rt.write(uuid, Frame::publish(&msg.channel, &msg.payload, msg.filter).encode());
    }

    // master (or a lone process): relay straight to every worker
    let links: Vec<Uuid> = {
        let cluster = core.cluster.lock().unwrap();

        cluster.links.iter().map(|l| l.uuid).collect()
    };

    if !links.is_empty() {
        let bytes = Frame::publish(&msg.channel, &msg.payload, msg.filter).encode();

        for uuid in links {
            if let Err(e) = rt.write(uuid, bytes.clone()) {
                warn!("[{:?}] relay to worker failed: {}", uuid, e);
            }
        }
    }

    bridge_publish(rt, msg);
    Ok(())
}

fn bridge_publish(rt: &Runtime, msg: &Arc<Message>) {
    let mut cluster = rt.core().cluster.lock().unwrap();

    if let Some(ref mut bridge) = cluster.bridge {
        bridge.publish(&msg.channel, &msg.payload, msg.filter);
    }
}

/// Called when the first local subscription for a channel appears or
/// the last one goes: workers tell the master, the master feeds the
/// bridge.
pub fn note_subscribe(rt: &Runtime, channel: &[u8], pattern: bool, subscribe: bool) {
    let upstream = rt.core().cluster.lock().unwrap().upstream;

    match upstream {
        Some(uuid) => {
            let frame = Frame::subscription(channel, pattern, subscribe);

            if let Err(e) = rt.write(uuid, frame.encode()) {
                warn!("[{:?}] subscription report failed: {}", uuid, e);
            }
        }
        None => master_ref_change(rt, channel, pattern, subscribe)
    }
}

fn master_ref_change(rt: &Runtime, channel: &[u8], pattern: bool, add: bool) {
    let mut cluster = rt.core().cluster.lock().unwrap();
    let key = (channel.to_vec(), pattern);
    let edge = if add {
        let count = cluster.refs.entry(key).or_insert(0);

        *count += 1;
        *count == 1
    } else {
        match cluster.refs.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count == 0
            }
            _ => false
        }
    };

    if edge {
        if !add {
            cluster.refs.remove(&(channel.to_vec(), pattern));
        }
        if let Some(ref mut bridge) = cluster.bridge {
            if add {
                bridge.subscribe(channel, pattern);
            } else {
                bridge.unsubscribe(channel, pattern);
            }
        }
    }
}

/// Master-side heartbeat: one ping per worker, answered by the worker
/// end of the bus.
pub fn ping_workers(rt: &Runtime) {
    let links: Vec<Uuid> = {
        let cluster = rt.core().cluster.lock().unwrap();

        cluster.links.iter().map(|l| l.uuid).collect()
    };
    let bytes = Frame::ping().encode();

    for uuid in links {
        let _ = rt.write(uuid, bytes.clone());
    }
}

/// Pushes a shutdown frame to every worker and flags the wind-down.
pub fn broadcast_shutdown(rt: &Runtime) {
    let links: Vec<Uuid> = {
        let mut cluster = rt.core().cluster.lock().unwrap();

        cluster.stopping = true;
        cluster.links.iter().map(|l| l.uuid).collect()
    };
    let bytes = Frame::shutdown().encode();

    for uuid in links {
        let _ = rt.write(uuid, bytes.clone());
    }
}

// ----------------------------------------------------------------------------
// worker side of the bus
// ----------------------------------------------------------------------------

struct UpstreamLink {
    codec: FrameCodec
}

impl Protocol for UpstreamLink {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        match pump_frames(rt, uuid, &mut self.codec, &mut |rt, frame| {
            match frame.ftype {
                FrameType::Publish => {
                    let msg = Message::new(frame.channel, frame.payload, frame.filter, 0);

                    rt.core().engine.fanout(rt, Arc::new(msg));
                }
                FrameType::Ping => {
                    let _ = rt.write(uuid, Frame::ping().encode());
                }
                FrameType::Shutdown => {
                    info!("worker {}: shutdown frame received", rt.pid());
                    rt.stop();
                }
                other => debug!("[{:?}] ignoring {:?} frame from the master", uuid, other)
            }
        }) {
            Ok(_) => (),
            Err(e) => {
                // bus corruption is fatal to the worker; the supervisor
                // will bring a fresh one up
                error!("worker {}: bus corrupted: '{:?}'", rt.pid(), e);
                mark_upstream_lost(rt);
                rt.stop();
            }
        }
    }

    fn on_close(&mut self, rt: &Runtime, _uuid: Uuid) {
        if rt.is_running() && rt.is_worker() {
            error!("worker {}: master connection lost", rt.pid());
            mark_upstream_lost(rt);
            rt.stop();
        }
    }
}

fn mark_upstream_lost(rt: &Runtime) {
    let mut cluster = rt.core().cluster.lock().unwrap();

    cluster.upstream = None;
    cluster.upstream_lost = true;
}

pub fn upstream_lost(rt: &Runtime) -> bool {
    rt.core().cluster.lock().unwrap().upstream_lost
}

// ----------------------------------------------------------------------------
// master side of the bus
// ----------------------------------------------------------------------------

struct MasterLink {
    uuid: Uuid,
    codec: FrameCodec,
    refs: HashSet<(Vec<u8>, bool)>
}

impl Protocol for MasterLink {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        let own = self.uuid;
        let refs = &mut self.refs;

        match pump_frames(rt, uuid, &mut self.codec, &mut |rt, frame| {
            match frame.ftype {
                FrameType::Identify => {
                    if frame.payload.len() >= 4 {
                        let pid = BigEndian::read_u32(&frame.payload[0..4]) as libc::pid_t;
                        let mut cluster = rt.core().cluster.lock().unwrap();

                        if let Some(link) = cluster.links.iter_mut().find(|l| l.uuid == own) {
                            link.pid = pid;
                        }
                        debug!("[{:?}] worker identified as pid {}", own, pid);
                    }
                }
                FrameType::Subscribe => {
                    let pattern = frame.flags & FLAG_PATTERN != 0;

                    if refs.insert((frame.channel.clone(), pattern)) {
                        master_ref_change(rt, &frame.channel, pattern, true);
                    }
                }
                FrameType::Unsubscribe => {
                    let pattern = frame.flags & FLAG_PATTERN != 0;

                    if refs.remove(&(frame.channel.clone(), pattern)) {
                        master_ref_change(rt, &frame.channel, pattern, false);
                    }
                }
                FrameType::Publish => {
                    relay_publish(rt, own, frame);
                }
                FrameType::Ping => {
                    // the worker answering the heartbeat; replying here
                    // would bounce the frame back and forth forever
                    debug!("[{:?}] worker heartbeat", own);
                }
                FrameType::Shutdown => {
                    info!("stop requested over the bus");
                    ::supervisor::initiate_stop(rt);
                }
            }
        }) {
            Ok(_) => (),
            Err(e) => {
                error!("[{:?}] worker corrupted the bus: '{:?}'", uuid, e);
                let _ = rt.close(uuid);
            }
        }
    }

    fn on_close(&mut self, rt: &Runtime, uuid: Uuid) {
        let orphaned: Vec<(Vec<u8>, bool)> = self.refs.drain().collect();

        for (channel, pattern) in orphaned {
            master_ref_change(rt, &channel, pattern, false);
        }

        let mut cluster = rt.core().cluster.lock().unwrap();

        cluster.links.retain(|l| l.uuid != uuid);
        if cluster.stopping && cluster.links.is_empty() {
            drop(cluster);
            rt.stop();
        }
    }
}

/// The master saw a publication from one worker: every other worker
/// gets a copy, the master's own subscribers are served locally, and
/// the bridge hears about it. The originator already delivered to its
/// local subscribers at publish time, so it is skipped.
fn relay_publish(rt: &Runtime, from: Uuid, frame: Frame) {
    let links: Vec<Uuid> = {
        let cluster = rt.core().cluster.lock().unwrap();

        cluster.links.iter().map(|l| l.uuid).filter(|&u| u != from).collect()
    };

    if !links.is_empty() {
        let bytes = frame.encode();

        for uuid in links {
            if let Err(e) = rt.write(uuid, bytes.clone()) {
                warn!("[{:?}] relay to worker failed: {}", uuid, e);
            }
        }
    }

    let msg = Arc::new(Message::new(frame.channel, frame.payload, frame.filter, 0));

    bridge_publish(rt, &msg);
    rt.core().engine.fanout(rt, msg);
}

/// Reads everything the socket has, feeding complete frames to `apply`.
fn pump_frames(rt: &Runtime,
               uuid: Uuid,
               codec: &mut FrameCodec,
               apply: &mut FnMut(&Runtime, Frame)) -> io::Result<()> {
    let mut chunk = [0u8; 16 * 1024];

    loop {
        match rt.read(uuid, &mut chunk) {
            Ok(n) => codec.feed(&chunk[..n]),
            Err(SockError::WouldBlock) => break,
            Err(SockError::Closed) => {
                let _ = rt.close(uuid);
                break;
            }
            Err(e) => {
                debug!("[{:?}] bus read failed: {}", uuid, e);
                let _ = rt.close(uuid);
                break;
            }
        }
    }

    while let Some(frame) = codec.next()? {
        apply(rt, frame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut codec = FrameCodec::new(1024 * 1024);
        let encoded = frame.encode();

        // trickle the bytes in to exercise resumption
        for byte in encoded.iter() {
            codec.feed(&[*byte]);
        }

        let decoded = codec.next().unwrap().unwrap();

        assert_eq!(frame, decoded);
        assert!(codec.next().unwrap().is_none());
    }

    #[test]
    fn frames_roundtrip() {
        roundtrip(Frame::publish(b"chat", b"hi there", 0));
        roundtrip(Frame::publish(b"chat", b"tagged", 0xDEAD_BEEF));
        roundtrip(Frame::subscription(b"chat.*", true, true));
        roundtrip(Frame::subscription(b"chat", false, false));
        roundtrip(Frame::ping());
        roundtrip(Frame::shutdown());
        roundtrip(Frame::identify(4242));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut codec = FrameCodec::new(1024);
        let mut bytes = Frame::ping().encode();

        bytes[0] = 0x00;
        codec.feed(&bytes);
        assert!(codec.next().is_err());
    }

    #[test]
    fn oversized_frames_are_fatal() {
        let mut codec = FrameCodec::new(8);

        codec.feed(&Frame::publish(b"chat", b"way too long", 0).encode());
        assert!(codec.next().is_err());
    }

    #[test]
    fn pipelined_frames_come_out_in_order(){
        let mut codec = FrameCodec::new(1024);
        let mut bytes = Frame::publish(b"a", b"1", 0).encode();

        bytes.extend_from_slice(&Frame::publish(b"b", b"2", 0).encode());
        codec.feed(&bytes);

        assert_eq!(b"a".to_vec(), codec.next().unwrap().unwrap().channel);
        assert_eq!(b"b".to_vec(), codec.next().unwrap().unwrap().channel);
        assert!(codec.next().unwrap().is_none());
    }
}
