// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// Server-Sent Events: a chunked `text/event-stream` response that
/// never ends. Reached through the same upgrade hook as WebSocket,
/// under the `"sse"` token.

use std::io::Write;

use global::{SockError, SockResult, Uuid};
use http::request::{chunk_encode, Request};
use protocol::Protocol;
use pubsub::Subscribe;
use runtime::Runtime;

pub struct SseSettings {
    pub on_open: Option<Box<FnMut(&Runtime, Uuid) + Send>>,
    pub on_close: Option<Box<FnMut(&Runtime, Uuid) + Send>>,
    /// Seconds between keep-alive comments on an idle stream.
    pub timeout: u8
}

impl SseSettings {
    pub fn new() -> SseSettings {
        SseSettings {
            on_open: None,
            on_close: None,
            timeout: 40
        }
    }
}

/// One event on the stream.
pub struct SseEvent<'a> {
    pub id: Option<&'a str>,
    pub event: Option<&'a str>,
    pub data: &'a [u8]
}

/// Finalizes the upgrade of `request` into an event stream.
pub fn upgrade(rt: &Runtime, request: &mut Request, settings: SseSettings) -> SockResult<()> {
    let mut settings = settings;
    let uuid = request.uuid();

    request.set_status(200);
    request.set_header("Content-Type", "text/event-stream");
    request.set_header("Cache-Control", "no-cache");
    request.begin_stream(rt)?;
    request.mark_upgraded();
    rt.set_timeout(uuid, settings.timeout)?;

    if let Some(ref mut on_open) = settings.on_open {
        on_open(rt, uuid);
    }
    rt.attach(uuid, Box::new(SseProto { settings: settings }))
}

/// Emits one event, `id:`/`event:` fields first, `data:` lines after.
pub fn write(rt: &Runtime, uuid: Uuid, event: SseEvent) -> SockResult<()> {
    let mut body = Vec::with_capacity(event.data.len() + 32);

    if let Some(id) = event.id {
        let _ = write!(body, "id: {}\n", id);
    }
    if let Some(name) = event.event {
        let _ = write!(body, "event: {}\n", name);
    }
    for line in event.data.split(|&b| b == b'\n') {
        body.extend_from_slice(b"data: ");
        body.extend_from_slice(line);
        body.push(b'\n');
    }
    body.push(b'\n');
    rt.write(uuid, chunk_encode(&body))
}

/// Subscribes the stream to a channel; publications arrive as `data:`
/// events named after the channel. Revoked when the stream closes.
pub fn subscribe(rt: &Runtime, uuid: Uuid, channel: &[u8]) -> SockResult<u64> {
    let name = String::from_utf8_lossy(channel).into_owned();

    rt.subscribe(Subscribe {
        channel: channel.to_vec(),
        matcher: None,
        on_message: Box::new(move |rt: &Runtime, msg| {
            let event = SseEvent {
                id: None,
                event: Some(&name),
                data: &msg.payload
            };

            if let Err(e) = write(rt, uuid, event) {
                debug!("[{:?}] event stream write failed: {}", uuid, e);
            }
        }),
        on_unsubscribe: None,
        filter: 0,
        owner: Some(uuid)
    })
}

struct SseProto {
    settings: SseSettings
}

impl Protocol for SseProto {
    fn on_data(&mut self, rt: &Runtime, uuid: Uuid) {
        // an event stream is one way; swallow anything the peer sends
        let mut sink = [0u8; 1024];

        loop {
            match rt.read(uuid, &mut sink) {
                Ok(_) => (),
                Err(SockError::WouldBlock) => break,
                Err(_) => {
                    let _ = rt.close(uuid);
                    break;
                }
            }
        }
    }

    fn on_ping(&mut self, rt: &Runtime, uuid: Uuid) {
        let _ = rt.write(uuid, chunk_encode(b": keep-alive\n\n"));
    }

    fn on_shutdown(&mut self, rt: &Runtime, uuid: Uuid) {
        let _ = rt.write(uuid, b"0\r\n\r\n".to_vec());
    }

    fn on_close(&mut self, rt: &Runtime, uuid: Uuid) {
        if let Some(ref mut on_close) = self.settings.on_close {
            on_close(rt, uuid);
        }
    }
}
