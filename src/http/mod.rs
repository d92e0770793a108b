// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// HTTP/1.1 over the reactor: keep-alive and pipelining by default,
/// bounded parsing, and the upgrade path that swaps the connection's
/// protocol for WebSocket or Server-Sent Events on the same uuid.

pub mod request;
pub mod sse;
mod parser;

pub use self::parser::{Limits, ParseError, Parser, tmpfile};
pub use self::request::{Body, Headers, Request, status_text};

use std::sync::Arc;

use global::{SockError, Uuid};
use protocol::{Factory, Protocol};
use runtime::Runtime;

pub struct HttpSettings {
    /// Runs for every complete request that is not an upgrade. Not
    /// responding is answered with a 404 on the handler's behalf.
    pub on_request: Box<Fn(&Runtime, &mut Request) + Send + Sync>,
    /// Runs for `websocket` and `sse` upgrade requests; the handler
    /// either finalizes the upgrade or responds with a rejection.
    pub on_upgrade: Option<Box<Fn(&Runtime, &mut Request, &str) + Send + Sync>>,
    /// Most bytes a request head may occupy in one read cycle.
    pub max_head: usize,
    pub max_headers: usize,
    pub max_body: u64,
    /// Bodies above this spill to a temporary file.
    pub body_memory: usize,
    /// Seconds of keep-alive idleness before the connection closes.
    pub timeout: u8,
    /// Log one line per request.
    pub log: bool
}

impl HttpSettings {
    pub fn new(on_request: Box<Fn(&Runtime, &mut Request) + Send + Sync>) -> HttpSettings {
        HttpSettings {
            on_request: on_request,
            on_upgrade: None,
            max_head: 8 * 1024,
            max_headers: 128,
            max_body: 50 * 1024 * 1024,
            body_memory: 256 * 1024,
            timeout: 10,
            log: false
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            max_head: self.max_head,
            max_headers: self.max_headers,
            max_body: self.max_body,
            body_memory: self.body_memory
        }
    }
}

/// Binds an HTTP listener.
pub fn listen(rt: &Runtime, addr: &str, settings: HttpSettings) -> ::std::io::Result<Uuid> {
    rt.listen(addr, Box::new(HttpFactory { settings: Arc::new(settings) }))
}

struct HttpFactory {
    settings: Arc<HttpSettings>
}

impl Factory for HttpFactory {
    fn on_open(&mut self, rt: &Runtime, uuid: Uuid) -> Option<Box<Protocol>> {
        let _ = rt.set_timeout(uuid, self.settings.timeout);
        Some(Box::new(Http1::new(self.settings.clone())))
    }
}

pub struct Http1 {
    settings: Arc<HttpSettings>,
    parser: Parser
}

impl Http1 {
    pub fn new(settings: Arc<HttpSettings>) -> Http1 {
        Http1 {
            settings: settings,
            parser: Parser::new()
        }
    }

    // returns false when this protocol no longer owns the connection
    fn dispatch(&mut self, rt: &Runtime, uuid: Uuid, request: &mut Request) -> bool {
        match upgrade_token(request) {
            Some(token) => {
                // bytes read past the head belong to the next protocol
                // if the upgrade goes through
                request.set_leftover(self.parser.take_buffered());
                match self.settings.on_upgrade {
                    Some(ref on_upgrade) => {
                        debug!("[{:?}] upgrade requested: {}", uuid, token);
                        on_upgrade(rt, request, token);
                    }
                    None => {
                        request.set_status(400);
                    }
                }
                if !request.upgraded() {
                    // rejected: whatever followed is pipelined input again
                    let leftover = request.take_leftover();

                    self.parser.feed(&leftover);
                }
            }
            None => {
                (self.settings.on_request)(rt, request);
            }
        }

        if !request.replied() {
            request.set_status(404);
            let _ = request.send(rt, b"");
        }
        if self.settings.log {
            log_request(request);
        }
        if request.upgraded() {
            // the websocket/sse protocol owns the uuid from here
            return false;
        }
        if request.wants_close() {
            let _ = rt.close(uuid);
            return false;
        }
        true
    }

    fn reject(&self, rt: &Runtime, uuid: Uuid, error: ParseError) {
        let status = match error {
            ParseError::Malformed => 400,
            ParseError::HeadTooLarge => 431,
            ParseError::BodyTooLarge => 413,
            ParseError::Internal => 500
        };

        debug!("[{:?}] request rejected: {:?}", uuid, error);

        let head = format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                           status,
                           status_text(status));

        let _ = rt.write(uuid, head.into_bytes());
        let _ = rt.close(uuid);
    }
}

impl Protocol for Http1 {
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

        loop {
            match self.parser.next(uuid, &self.settings.limits()) {
                Ok(Some(mut request)) => {
                    if !self.dispatch(rt, uuid, &mut request) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    self.reject(rt, uuid, error);
                    return;
                }
            }
        }
    }
}

/// Decides whether a request asks to leave HTTP. `Upgrade: websocket`
/// is the real thing; the `sse` token and an `Accept: text/event-stream`
/// both select the EventSource path.
fn upgrade_token(request: &Request) -> Option<&'static str> {
    let upgrading = request.header("connection")
        .map(|v| request::contains_token(v, "upgrade"))
        .unwrap_or(false);

    if upgrading {
        match request.header("upgrade") {
            Some(token) if token.eq_ignore_ascii_case("websocket") => return Some("websocket"),
            Some(token) if token.eq_ignore_ascii_case("sse") => return Some("sse"),
            _ => return None
        }
    }

    match request.header("accept") {
        Some(accept) if accept.eq_ignore_ascii_case("text/event-stream") => Some("sse"),
        _ => None
    }
}

fn log_request(request: &Request) {
    let elapsed = ::time::get_time() - request.received_at;

    info!("{} {}{} {} {}ms",
          request.method,
          request.path,
          request.query.as_ref().map(|q| format!("?{}", q)).unwrap_or_default(),
          request.status,
          elapsed.num_milliseconds());
}

#[cfg(test)]
mod tests {
    use global::Uuid;
    use http::request::Request;

    use super::upgrade_token;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut request = Request::new(Uuid::compose(4, 0));

        for &(name, value) in headers {
            request.headers.add(name, value);
        }
        request
    }

    #[test]
    fn websocket_upgrades_are_detected() {
        let request = request_with(&[("Connection", "keep-alive, Upgrade"), ("Upgrade", "websocket")]);

        assert_eq!(Some("websocket"), upgrade_token(&request));
    }

    #[test]
    fn sse_rides_the_same_hook() {
        let by_upgrade = request_with(&[("Connection", "Upgrade"), ("Upgrade", "sse")]);
        let by_accept = request_with(&[("Accept", "text/event-stream")]);

        assert_eq!(Some("sse"), upgrade_token(&by_upgrade));
        assert_eq!(Some("sse"), upgrade_token(&by_accept));
    }

    #[test]
    fn plain_requests_stay_http() {
        let request = request_with(&[("Connection", "keep-alive")]);

        assert_eq!(None, upgrade_token(&request));
    }
}
