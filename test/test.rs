// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

#[macro_use]
extern crate log;
extern crate env_logger;
extern crate evio;

use std::io;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use evio::{Config, Factory, Protocol, Runtime, SockError, Subscribe, Uuid};
use evio::ws::codec::{client_wrap, FrameParser, WsEvent, OP_BINARY, OP_CONT, OP_PING, OP_TEXT};

fn runtime() -> Runtime {
    let mut config = Config::default();

    config.capacity = 1024;
    config.threads = 1;
    Runtime::new(config).unwrap()
}

fn start(rt: &Runtime) -> thread::JoinHandle<()> {
    let clone = rt.clone();
    let handle = thread::spawn(move || {
        let _ = clone.run();
    });

    wait_until("the reactor to come up", || rt.is_running());
    handle
}

fn wait_until<F>(what: &str, cond: F) where F : Fn() -> bool {
    for _ in 0..600 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

struct Echo {
    closes: Arc<AtomicUsize>
}

impl Protocol for Echo {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut buf = [0u8; 4096];

        loop {
            match rt.read(uuid, &mut buf) {
                Ok(n) => {
                    rt.write(uuid, buf[..n].to_vec()).unwrap();
                }
                Err(SockError::WouldBlock) => break,
                Err(_) => {
                    let _ = rt.close(uuid);
                    break;
                }
            }
        }
    }

    fn on_close(&mut self, _rt: &Runtime, _uuid: Uuid) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct EchoFactory {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    last_uuid: Arc<Mutex<Option<Uuid>>>
}

impl Factory for EchoFactory {
    fn on_open(&mut self, _rt: &Runtime, uuid: Uuid) -> Option<Box<Protocol>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_uuid.lock().unwrap() = Some(uuid);
        Some(Box::new(Echo { closes: self.closes.clone() }))
    }
}

fn echo_server(rt: &Runtime, addr: &str)
    -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<Mutex<Option<Uuid>>>) {
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let last_uuid = Arc::new(Mutex::new(None));

    rt.listen(addr, Box::new(EchoFactory {
        opens: opens.clone(),
        closes: closes.clone(),
        last_uuid: last_uuid.clone()
    })).unwrap();

    (opens, closes, last_uuid)
}

#[test]
fn test_echo_roundtrip() {
    let _ = env_logger::init();
    let rt = runtime();
    let (opens, closes, _) = echo_server(&rt, "127.0.0.1:5600");
    let handle = start(&rt);

    {
        let mut client = TcpStream::connect("127.0.0.1:5600").unwrap();

        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        client.write_all(b"ABC").unwrap();

        let mut reply = [0u8; 3];

        client.read_exact(&mut reply).unwrap();
        assert_eq!(b"ABC", &reply);
    }

    wait_until("the open callback", || opens.load(Ordering::SeqCst) == 1);
    wait_until("the close callback", || closes.load(Ordering::SeqCst) == 1);
    assert_eq!(1, opens.load(Ordering::SeqCst));
    assert_eq!(1, closes.load(Ordering::SeqCst));
    info!("echo roundtrip done");

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_stale_uuid_is_refused() {
    let _ = env_logger::init();
    let rt = runtime();
    let (_, closes, last_uuid) = echo_server(&rt, "127.0.0.1:5601");
    let handle = start(&rt);

    {
        let mut client = TcpStream::connect("127.0.0.1:5601").unwrap();

        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        client.write_all(b"hi").unwrap();

        let mut reply = [0u8; 2];

        client.read_exact(&mut reply).unwrap();
    }

    wait_until("the close callback", || closes.load(Ordering::SeqCst) == 1);

    let stale = last_uuid.lock().unwrap().take().unwrap();

    match rt.write(stale, b"never".to_vec()) {
        Err(SockError::BadUuid) => (),
        other => panic!("expected BadUuid, got {:?}", other)
    }
    match rt.read(stale, &mut [0u8; 4]) {
        Err(SockError::BadUuid) => (),
        other => panic!("expected BadUuid, got {:?}", other)
    }

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_http_keep_alive_pipelining() {
    let _ = env_logger::init();
    let rt = runtime();
    let settings = evio::http::HttpSettings::new(Box::new(|rt: &Runtime, req: &mut evio::http::Request| {
        req.set_header("Content-Type", "text/plain");
        let _ = req.send(rt, b"Hello");
    }));

    evio::http::listen(&rt, "127.0.0.1:5602", settings).unwrap();

    let handle = start(&rt);
    let mut client = TcpStream::connect("127.0.0.1:5602").unwrap();

    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\
                      GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").unwrap();

    let mut raw = Vec::new();

    client.read_to_end(&mut raw).unwrap();

    let text = String::from_utf8_lossy(&raw);

    assert_eq!(2, text.matches("HTTP/1.1 200 OK").count());
    assert_eq!(2, text.matches("Hello").count());
    assert!(text.contains("Connection: close"));

    rt.stop();
    handle.join().unwrap();
}

struct WsEcho;

impl evio::ws::WsHandler for WsEcho {
    fn on_message(&mut self, rt: &Runtime, ws: &mut evio::ws::Ws, payload: Vec<u8>, is_text: bool) {
        if is_text {
            ws.write_text(rt, ::std::str::from_utf8(&payload).unwrap()).unwrap();
        } else {
            ws.write_binary(rt, &payload).unwrap();
        }
    }
}

const WS_UPGRADE_REQUEST: &'static [u8] =
    b"GET /live HTTP/1.1\r\n\
      Host: x\r\n\
      Connection: Upgrade\r\n\
      Upgrade: websocket\r\n\
      Sec-WebSocket-Version: 13\r\n\
      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

fn read_http_head(client: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn check_ws_reply(head: &str) {
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake reply: {}", head);
    assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
}

fn ws_handshake(addr: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client.write_all(WS_UPGRADE_REQUEST).unwrap();

    let head = read_http_head(&mut client);

    check_ws_reply(&head);
    client
}

fn ws_listen(rt: &Runtime, addr: &str) {
    let mut settings = evio::http::HttpSettings::new(Box::new(|rt: &Runtime, req: &mut evio::http::Request| {
        req.set_status(404);
        let _ = req.send(rt, b"");
    }));

    settings.on_upgrade = Some(Box::new(|rt: &Runtime, req: &mut evio::http::Request, token: &str| {
        assert_eq!("websocket", token);

        let ws_settings = evio::ws::WsSettings::new(Box::new(WsEcho));

        evio::ws::upgrade(rt, req, ws_settings).unwrap();
    }));
    evio::http::listen(rt, addr, settings).unwrap();
}

fn next_ws_event(client: &mut TcpStream, parser: &mut FrameParser) -> WsEvent {
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(event) = parser.next().unwrap() {
            return event;
        }
        match client.read(&mut chunk) {
            Ok(0) => panic!("server closed mid-conversation"),
            Ok(n) => parser.feed(&chunk[..n]),
            Err(e) => panic!("read failed: {}", e)
        }
    }
}

#[test]
fn test_websocket_fragmented_text() {
    let _ = env_logger::init();
    let rt = runtime();

    ws_listen(&rt, "127.0.0.1:5603");

    let handle = start(&rt);
    let mut client = ws_handshake("127.0.0.1:5603");
    let mask = [0x11, 0x22, 0x33, 0x44];

    client.write_all(&client_wrap(b"Hel", OP_TEXT, false, mask)).unwrap();
    client.write_all(&client_wrap(b"lo ", OP_CONT, false, mask)).unwrap();
    client.write_all(&client_wrap(b"World", OP_CONT, true, mask)).unwrap();

    let mut parser = FrameParser::new(false, 1024 * 1024);

    match next_ws_event(&mut client, &mut parser) {
        WsEvent::Message { payload, is_text } => {
            assert!(is_text);
            assert_eq!(b"Hello World".to_vec(), payload);
        }
        other => panic!("expected the echoed message, got {:?}", other)
    }

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_websocket_ping_under_load() {
    let _ = env_logger::init();
    let rt = runtime();

    ws_listen(&rt, "127.0.0.1:5604");

    let handle = start(&rt);
    let mut client = ws_handshake("127.0.0.1:5604");
    let mask = [0xAA, 0xBB, 0xCC, 0xDD];
    let frames = 100u8;

    for n in 0..frames {
        client.write_all(&client_wrap(&[n], OP_BINARY, true, mask)).unwrap();
        if n == frames / 2 {
            client.write_all(&client_wrap(b"x", OP_PING, true, mask)).unwrap();
        }
    }

    let mut parser = FrameParser::new(false, 1024 * 1024);
    let mut echoed = Vec::new();
    let mut pongs = 0;

    while echoed.len() < frames as usize {
        match next_ws_event(&mut client, &mut parser) {
            WsEvent::Message { payload, .. } => echoed.push(payload[0]),
            WsEvent::Pong(payload) => {
                assert_eq!(b"x".to_vec(), payload);
                pongs += 1;
            }
            other => panic!("unexpected frame: {:?}", other)
        }
    }

    let expected: Vec<u8> = (0..frames).collect();

    assert_eq!(expected, echoed);
    assert_eq!(1, pongs);

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_websocket_frame_glued_to_handshake() {
    let _ = env_logger::init();
    let rt = runtime();

    ws_listen(&rt, "127.0.0.1:5606");

    let handle = start(&rt);
    let mut client = TcpStream::connect("127.0.0.1:5606").unwrap();

    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();

    // the first frame rides in the very same segment as the handshake;
    // it must come back once the upgrade completes
    let mut bytes = WS_UPGRADE_REQUEST.to_vec();

    bytes.extend_from_slice(&client_wrap(b"early", OP_BINARY, true, [0x01, 0x02, 0x03, 0x04]));
    client.write_all(&bytes).unwrap();

    let head = read_http_head(&mut client);

    check_ws_reply(&head);

    let mut parser = FrameParser::new(false, 1024 * 1024);

    match next_ws_event(&mut client, &mut parser) {
        WsEvent::Message { payload, .. } => assert_eq!(b"early".to_vec(), payload),
        other => panic!("expected the glued frame echoed, got {:?}", other)
    }

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_pubsub_fanout_order_and_exactly_once() {
    let _ = env_logger::init();
    let rt = runtime();
    let handle = start(&rt);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    rt.subscribe(Subscribe {
        channel: b"chat".to_vec(),
        matcher: None,
        on_message: Box::new(move |_rt: &Runtime, msg| {
            sink.lock().unwrap().push(msg.payload.clone());
        }),
        on_unsubscribe: None,
        filter: 0,
        owner: None
    }).unwrap();

    rt.publish(b"chat", b"one", 0).unwrap();
    rt.publish(b"chat", b"two", 0).unwrap();
    rt.publish(b"chat", b"three", 0).unwrap();
    rt.publish(b"other", b"noise", 0).unwrap();

    wait_until("three deliveries", || received.lock().unwrap().len() == 3);
    thread::sleep(Duration::from_millis(50));

    let received = received.lock().unwrap();

    assert_eq!(vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()], *received);

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_pubsub_pattern_and_filter() {
    let _ = env_logger::init();
    let rt = runtime();
    let handle = start(&rt);
    let matched = Arc::new(AtomicUsize::new(0));
    let tagged = Arc::new(AtomicUsize::new(0));

    {
        let matched = matched.clone();

        rt.subscribe(Subscribe {
            channel: b"chat.*".to_vec(),
            matcher: Some(evio::glob_match),
            on_message: Box::new(move |_rt: &Runtime, _msg| {
                matched.fetch_add(1, Ordering::SeqCst);
            }),
            on_unsubscribe: None,
            filter: 0,
            owner: None
        }).unwrap();
    }
    {
        let tagged = tagged.clone();

        rt.subscribe(Subscribe {
            channel: b"metrics".to_vec(),
            matcher: None,
            on_message: Box::new(move |_rt: &Runtime, _msg| {
                tagged.fetch_add(1, Ordering::SeqCst);
            }),
            on_unsubscribe: None,
            filter: 7,
            owner: None
        }).unwrap();
    }

    rt.publish(b"chat.room", b"in", 0).unwrap();
    rt.publish(b"lobby", b"out", 0).unwrap();
    rt.publish(b"metrics", b"kept", 7).unwrap();
    rt.publish(b"metrics", b"dropped", 8).unwrap();

    wait_until("the pattern delivery", || matched.load(Ordering::SeqCst) == 1);
    wait_until("the filtered delivery", || tagged.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(1, matched.load(Ordering::SeqCst));
    assert_eq!(1, tagged.load(Ordering::SeqCst));

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_timer_repetitions_then_finish() {
    let _ = env_logger::init();
    let rt = runtime();
    let handle = start(&rt);
    let fired = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    {
        let fired = fired.clone();
        let finished = finished.clone();

        rt.run_every(Duration::from_millis(20),
                     3,
                     Box::new(move |_rt: &Runtime| {
                         fired.fetch_add(1, Ordering::SeqCst);
                     }),
                     Some(Box::new(move |_rt: &Runtime| {
                         finished.fetch_add(1, Ordering::SeqCst);
                     })));
    }

    wait_until("three timer runs", || fired.load(Ordering::SeqCst) == 3);
    wait_until("the finish hook", || finished.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(3, fired.load(Ordering::SeqCst));
    assert_eq!(1, finished.load(Ordering::SeqCst));

    rt.stop();
    handle.join().unwrap();
}

// A line-driven control protocol for the cluster test. Each accepted
// connection first reports the pid of the worker that owns it, then
// obeys "sub" (subscribe this connection to the chat channel) and
// "pub <payload>" (publish to it).
struct Ctrl {
    buf: Vec<u8>
}

impl Protocol for Ctrl {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut chunk = [0u8; 1024];

        loop {
            match rt.read(uuid, &mut chunk) {
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(SockError::WouldBlock) => break,
                Err(_) => {
                    let _ = rt.close(uuid);
                    return;
                }
            }
        }

        while let Some(at) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf[..at].to_vec();

            self.buf.drain(..at + 1);
            ctrl_command(rt, uuid, &line);
        }
    }
}

fn ctrl_command(rt: &Runtime, uuid: Uuid, line: &[u8]) {
    if line == b"sub" {
        rt.subscribe(Subscribe {
            channel: b"chat".to_vec(),
            matcher: None,
            on_message: Box::new(move |rt: &Runtime, msg| {
                let mut out = b"msg:".to_vec();

                out.extend_from_slice(&msg.payload);
                out.push(b'\n');
                let _ = rt.write(uuid, out);
            }),
            on_unsubscribe: None,
            filter: 0,
            owner: Some(uuid)
        }).unwrap();
        rt.write(uuid, b"sub-ok\n".to_vec()).unwrap();
    } else if line.starts_with(b"pub ") {
        rt.publish(b"chat", &line[4..], 0).unwrap();
        rt.write(uuid, b"pub-ok\n".to_vec()).unwrap();
    }
}

struct CtrlFactory;

impl Factory for CtrlFactory {
    fn on_open(&mut self, rt: &Runtime, uuid: Uuid) -> Option<Box<Protocol>> {
        rt.write(uuid, format!("pid:{}\n", rt.pid()).into_bytes()).unwrap();
        Some(Box::new(Ctrl { buf: Vec::new() }))
    }
}

struct CtrlClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    pid: i64
}

fn ctrl_connect(addr: &str) -> CtrlClient {
    let writer = TcpStream::connect(addr).unwrap();

    writer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut reader = BufReader::new(writer.try_clone().unwrap());
    let pid_line = read_line(&mut reader);

    assert!(pid_line.starts_with("pid:"), "unexpected greeting: {}", pid_line);

    let pid = pid_line[4..].trim().parse::<i64>().unwrap();

    CtrlClient {
        writer: writer,
        reader: reader,
        pid: pid
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();

    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn test_cluster_pubsub_across_workers() {
    let _ = env_logger::init();

    let mut config = Config::default();

    config.capacity = 1024;
    config.threads = 1;
    config.workers = 2;
    config.join_timeout_ms = 1_000;

    let rt = Runtime::new(config).unwrap();

    rt.listen("127.0.0.1:5610", Box::new(CtrlFactory)).unwrap();

    let handle = start(&rt);

    // keep connecting until both workers accepted at least one
    // connection; with two reactors racing on the same listener a
    // handful of attempts is plenty
    let mut clients = vec![ctrl_connect("127.0.0.1:5610")];

    for _ in 0..60 {
        let first_pid = clients[0].pid;

        if clients.iter().any(|c| c.pid != first_pid) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        clients.push(ctrl_connect("127.0.0.1:5610"));
    }

    let first_pid = clients[0].pid;
    let publisher_at = clients.iter().position(|c| c.pid != first_pid)
        .expect("accepts never spread over both workers");

    info!("subscriber on worker {}, publisher on worker {}",
          first_pid, clients[publisher_at].pid);

    {
        let subscriber = &mut clients[0];

        subscriber.writer.write_all(b"sub\n").unwrap();
        assert_eq!("sub-ok\n", read_line(&mut subscriber.reader));
    }
    {
        let publisher = &mut clients[publisher_at];

        publisher.writer.write_all(b"pub over-the-bus\n").unwrap();
        assert_eq!("pub-ok\n", read_line(&mut publisher.reader));
    }
    {
        let subscriber = &mut clients[0];

        // the publication crossed publisher -> master -> subscriber's
        // worker before landing here
        assert_eq!("msg:over-the-bus\n", read_line(&mut subscriber.reader));

        // and exactly once: nothing else may arrive
        subscriber.writer.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

        let mut extra = String::new();

        match subscriber.reader.read_line(&mut extra) {
            Ok(0) => (),
            Ok(_) => panic!("duplicate delivery: {}", extra),
            Err(_) => ()
        }
    }

    rt.stop();
    handle.join().unwrap();
}

#[test]
fn test_writes_after_close_never_leave() {
    let _ = env_logger::init();
    let rt = runtime();
    let (_, _, last_uuid) = echo_server(&rt, "127.0.0.1:5605");
    let handle = start(&rt);
    let mut client = TcpStream::connect("127.0.0.1:5605").unwrap();

    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client.write_all(b"ping").unwrap();

    let mut reply = [0u8; 4];

    client.read_exact(&mut reply).unwrap();

    let uuid = last_uuid.lock().unwrap().unwrap();

    rt.close(uuid).unwrap();

    // whatever the race with the close task, the write must either be
    // refused or freed, never echoed after the close
    let _ = rt.write(uuid, b"late".to_vec());

    let mut rest = Vec::new();

    match client.read_to_end(&mut rest) {
        Ok(_) => assert_eq!(Vec::<u8>::new(), rest),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
        Err(e) => panic!("unexpected read failure: {}", e)
    }

    rt.stop();
    handle.join().unwrap();
}
