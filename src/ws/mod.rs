// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The WebSocket protocol over the reactor, server and client mode.
///
/// A server connection arrives here through the HTTP upgrade hook; a
/// client connection dials out, performs the handshake and masks every
/// frame it sends. Subscriptions forward publications straight to the
/// peer, reusing a pre-encoded frame cached on the message when the
/// fan-out crosses more than one socket.

pub mod codec;

use std::io;
use std::str;
use std::sync::Arc;

use base64;
use byteorder::{BigEndian, ByteOrder};
use httparse;
use rand;
use sha1;

use global::*;
use http::request::Request;
use protocol::{Factory, Protocol};
use pubsub::Subscribe;
use runtime::Runtime;

use self::codec::{FrameParser, WsError, WsEvent};

const WS_GUID: &'static str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Metadata key for the cached, server-ready rendition of a published
/// message.
pub const FRAME_META: u64 = 0xE710_F4A3;

// payloads above this are never sniffed for UTF-8 and go out binary
const TEXT_SNIFF_LIMIT: usize = 32 * 1024;

pub struct WsSettings {
    pub handler: Box<WsHandler>,
    pub max_message: usize,
    pub timeout: u8
}

impl WsSettings {
    pub fn new(handler: Box<WsHandler>) -> WsSettings {
        WsSettings {
            handler: handler,
            max_message: 256 * 1024,
            timeout: 40
        }
    }
}

pub trait WsHandler : Send {
    fn on_open(&mut self, _rt: &Runtime, _ws: &mut Ws) {
    }

    fn on_message(&mut self, _rt: &Runtime, _ws: &mut Ws, _payload: Vec<u8>, _is_text: bool) {
    }

    /// The outgoing queue drained.
    fn on_ready(&mut self, _rt: &Runtime, _ws: &mut Ws) {
    }

    fn on_shutdown(&mut self, _rt: &Runtime, _ws: &mut Ws) {
    }

    fn on_close(&mut self, _rt: &Runtime, _uuid: Uuid) {
    }
}

/// A borrowed view of one WebSocket connection.
#[derive(Copy, Clone)]
pub struct Ws {
    uuid: Uuid,
    client: bool
}

impl Ws {
    pub fn new(uuid: Uuid, client: bool) -> Ws {
        Ws { uuid: uuid, client: client }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn write_text(&self, rt: &Runtime, text: &str) -> SockResult<()> {
        write_frame(rt, self.uuid, self.client, codec::OP_TEXT, text.as_bytes())
    }

    pub fn write_binary(&self, rt: &Runtime, payload: &[u8]) -> SockResult<()> {
        write_frame(rt, self.uuid, self.client, codec::OP_BINARY, payload)
    }

    /// Starts the closing handshake.
    pub fn close(&self, rt: &Runtime) -> SockResult<()> {
        let _ = write_close(rt, self.uuid, self.client, 1000);
        rt.close(self.uuid)
    }

    /// Subscribes the socket to a channel; publications are forwarded
    /// to the peer as text or binary frames. Valid UTF-8 up to 32 KiB
    /// goes as text, everything else as binary. Revoked on close.
    pub fn subscribe(&self, rt: &Runtime, channel: &[u8]) -> SockResult<u64> {
        let uuid = self.uuid;
        let client = self.client;

        rt.subscribe(Subscribe {
            channel: channel.to_vec(),
            matcher: None,
            on_message: Box::new(move |rt: &Runtime, msg| {
                let result = if client {
                    // masks differ per frame, the shared rendition is of no use
                    let opcode = sniff_opcode(&msg.payload);

                    write_frame(rt, uuid, true, opcode, &msg.payload)
                } else {
                    let frame = match msg.meta(FRAME_META) {
                        Some(cached) => cached,
                        None => {
                            let opcode = sniff_opcode(&msg.payload);
                            let frame = codec::server_wrap(&msg.payload, opcode, true);

                            msg.set_meta(FRAME_META, Arc::new(frame))
                        }
                    };

                    rt.write(uuid, (*frame).clone())
                };

                if let Err(e) = result {
                    debug!("[{:?}] forward failed: {}", uuid, e);
                }
            }),
            on_unsubscribe: None,
            filter: 0,
            owner: Some(uuid)
        })
    }
}

fn sniff_opcode(payload: &[u8]) -> u8 {
    if payload.len() <= TEXT_SNIFF_LIMIT && str::from_utf8(payload).is_ok() {
        codec::OP_TEXT
    } else {
        codec::OP_BINARY
    }
}

fn write_frame(rt: &Runtime, uuid: Uuid, client: bool, opcode: u8, payload: &[u8]) -> SockResult<()> {
    let frame = if client {
        codec::client_wrap(payload, opcode, true, random_mask())
    } else {
        codec::server_wrap(payload, opcode, true)
    };

    rt.write(uuid, frame)
}

fn write_close(rt: &Runtime, uuid: Uuid, client: bool, code: u16) -> SockResult<()> {
    let mut payload = [0u8; 2];

    BigEndian::write_u16(&mut payload, code);
    write_frame(rt, uuid, client, codec::OP_CLOSE, &payload)
}

fn random_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];

    BigEndian::write_u32(&mut mask, rand::random::<u32>());
    mask
}

/// The `Sec-WebSocket-Accept` digest for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = sha1::Sha1::new();

    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.digest().bytes();
    base64::encode(&digest)
}

/// Finalizes an HTTP upgrade into a server-mode WebSocket: validates
/// the handshake, sends the 101, swaps the protocol on the same uuid.
pub fn upgrade(rt: &Runtime, request: &mut Request, settings: WsSettings) -> SockResult<()> {
    let uuid = request.uuid();
    let accept = match request.header("sec-websocket-key").map(accept_key) {
        Some(accept) => accept,
        None => {
            request.set_status(400);
            let _ = request.send(rt, b"");
            return Err(SockError::Io(invalid_data_io_error("missing websocket key")));
        }
    };

    if let Some(version) = request.header("sec-websocket-version") {
        if version.trim() != "13" {
            request.set_status(400);
            let _ = request.send(rt, b"");
            return Err(SockError::Io(invalid_data_io_error("unsupported websocket version")));
        }
    }

    request.set_status(101);
    request.set_header("Upgrade", "websocket");
    request.set_header("Connection", "Upgrade");
    request.set_header("Sec-WebSocket-Accept", &accept);
    request.send_head(rt)?;
    request.mark_upgraded();

    rt.set_timeout(uuid, settings.timeout)?;

    // frames the client glued to its handshake must reach the codec
    attach_protocol(rt, uuid, settings, false, request.take_leftover())
}

/// Dials `addr` and upgrades the connection into a client-mode
/// WebSocket once the server accepts the handshake.
pub fn connect(rt: &Runtime, addr: &str, path: &str, settings: WsSettings) -> io::Result<Uuid> {
    rt.connect(addr, Box::new(ClientFactory {
        host: addr.to_owned(),
        path: path.to_owned(),
        settings: Some(settings)
    }))
}

fn attach_protocol(rt: &Runtime,
                   uuid: Uuid,
                   settings: WsSettings,
                   client: bool,
                   leftover: Vec<u8>) -> SockResult<()> {
    let had_leftover = !leftover.is_empty();
    let mut parser = FrameParser::new(!client, settings.max_message);

    parser.feed(&leftover);

    let mut protocol = WsProto {
        handler: settings.handler,
        parser: parser,
        client: client,
        ping_outstanding: false,
        closing: false
    };
    let mut ws = Ws::new(uuid, client);

    protocol.handler.on_open(rt, &mut ws);
    if had_leftover {
        // no readiness event will replay these bytes; run them now.
        // the caller sits inside an `on_data`, so the connection lock
        // is held and this serialises like any other callback
        protocol.pump(rt, uuid);
    }
    rt.attach(uuid, Box::new(protocol))
}

pub struct WsProto {
    handler: Box<WsHandler>,
    parser: FrameParser,
    client: bool,
    ping_outstanding: bool,
    closing: bool
}

impl WsProto {
    /// Drains every complete event the parser holds. Runs under the
    /// connection lock, from `on_data` or the upgrade hand-off.
    fn pump(&mut self, rt: &Runtime, uuid: Uuid) {
        loop {
            match self.parser.next() {
                Ok(Some(WsEvent::Message { payload, is_text })) => {
                    self.ping_outstanding = false;

                    let mut ws = Ws::new(uuid, self.client);

                    self.handler.on_message(rt, &mut ws, payload, is_text);
                }
                Ok(Some(WsEvent::Ping(payload))) => {
                    let _ = write_frame(rt, uuid, self.client, codec::OP_PONG, &payload);
                }
                Ok(Some(WsEvent::Pong(_))) => {
                    self.ping_outstanding = false;
                    let _ = rt.touch(uuid);
                }
                Ok(Some(WsEvent::Close { code })) => {
                    debug!("[{:?}] close frame, code {}", uuid, code);
                    if !self.closing {
                        self.closing = true;
                        let _ = write_close(rt, uuid, self.client, 1000);
                    }
                    let _ = rt.close(uuid);
                    return;
                }
                Ok(None) => return,
                Err(error) => {
                    self.fail(rt, uuid, error);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, rt: &Runtime, uuid: Uuid, error: WsError) {
        let code = match error {
            WsError::Protocol(reason) => {
                debug!("[{:?}] websocket violation: {}", uuid, reason);
                1002
            }
            WsError::TooBig => 1009
        };

        if !self.closing {
            self.closing = true;
            let _ = write_close(rt, uuid, self.client, code);
        }
        let _ = rt.close(uuid);
    }
}

impl Protocol for WsProto {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut chunk = [0u8; 16 * 1024];

        loop {
            match rt.read(uuid, &mut chunk) {
                Ok(n) => self.parser.feed(&chunk[..n]),
                Err(SockError::WouldBlock) => break,
                Err(_) => {
                    let _ = rt.close(uuid);
                    break;
                }
            }
        }

        self.pump(rt, uuid);
    }

    fn on_ready(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut ws = Ws::new(uuid, self.client);

        self.handler.on_ready(rt, &mut ws);
    }

    fn on_shutdown(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut ws = Ws::new(uuid, self.client);

        self.handler.on_shutdown(rt, &mut ws);
        if !self.closing {
            self.closing = true;
            let _ = write_close(rt, uuid, self.client, 1001);
        }
    }

    fn on_close(&mut self, rt: &Runtime, uuid: Uuid) {
        self.handler.on_close(rt, uuid);
    }

    /// The inactivity timeout doubles as the ping schedule: first a
    /// protocol ping, then the axe.
    fn on_ping(&mut self, rt: &Runtime, uuid: Uuid) {
        if self.ping_outstanding {
            debug!("[{:?}] ping went unanswered", uuid);
            let _ = rt.close(uuid);
            return;
        }
        self.ping_outstanding = true;
        let _ = write_frame(rt, uuid, self.client, codec::OP_PING, b"");
    }
}

// ----------------------------------------------------------------------------
// client handshake
// ----------------------------------------------------------------------------

struct ClientFactory {
    host: String,
    path: String,
    settings: Option<WsSettings>
}

impl Factory for ClientFactory {
    fn on_open(&mut self, rt: &Runtime, uuid: Uuid) -> Option<Box<Protocol>> {
        let settings = self.settings.take()?;
        let key = client_key();
        let handshake = format!("GET {} HTTP/1.1\r\n\
                                 Host: {}\r\n\
                                 Upgrade: websocket\r\n\
                                 Connection: Upgrade\r\n\
                                 Sec-WebSocket-Key: {}\r\n\
                                 Sec-WebSocket-Version: 13\r\n\r\n",
                                self.path,
                                self.host,
                                key);

        if rt.write(uuid, handshake.into_bytes()).is_err() {
            return None;
        }
        Some(Box::new(ClientHandshake {
            key: key,
            settings: Some(settings),
            buf: Vec::new()
        }))
    }

    fn on_fail(&mut self, _rt: &Runtime, err: io::Error) {
        warn!("websocket connect to {} failed: '{:?}'", self.host, err);
    }
}

fn client_key() -> String {
    let mut nonce = [0u8; 16];

    for chunk in nonce.chunks_mut(4) {
        BigEndian::write_u32(chunk, rand::random::<u32>());
    }
    base64::encode(&nonce)
}

struct ClientHandshake {
    key: String,
    settings: Option<WsSettings>,
    buf: Vec<u8>
}

impl Protocol for ClientHandshake {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        let mut chunk = [0u8; 4096];

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

        let head_len = {
            let mut header_slots = [httparse::EMPTY_HEADER; 32];
            let mut response = httparse::Response::new(&mut header_slots);

            match response.parse(&self.buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let accepted = response.code == Some(101) && response.headers.iter()
                        .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
                        .map(|h| h.value == accept_key(&self.key).as_bytes())
                        .unwrap_or(false);

                    if !accepted {
                        debug!("[{:?}] handshake rejected by the server", uuid);
                        let _ = rt.close(uuid);
                        return;
                    }
                    head_len
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > 16 * 1024 {
                        let _ = rt.close(uuid);
                    }
                    return;
                }
                Err(_) => {
                    let _ = rt.close(uuid);
                    return;
                }
            }
        };

        debug!("[{:?}] handshake accepted", uuid);

        let leftover = self.buf[head_len..].to_vec();

        if let Some(settings) = self.settings.take() {
            let _ = attach_protocol(rt, uuid, settings, true, leftover);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{accept_key, client_key, sniff_opcode};
    use super::codec;

    #[test]
    fn accept_key_matches_the_rfc_vector() {
        assert_eq!("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", accept_key("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn client_keys_are_distinct_base64() {
        let one = client_key();
        let two = client_key();

        assert_eq!(24, one.len());
        assert!(one != two);
    }

    #[test]
    fn utf8_payloads_go_out_as_text() {
        assert_eq!(codec::OP_TEXT, sniff_opcode(b"plain words"));
        assert_eq!(codec::OP_BINARY, sniff_opcode(&[0xFF, 0xFE, 0x00]));

        let big = vec![b'a'; 64 * 1024];

        assert_eq!(codec::OP_BINARY, sniff_opcode(&big));
    }
}
