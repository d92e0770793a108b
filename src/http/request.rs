// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::fs;
use std::io::Write;

use time;

use global::{SockResult, Uuid};
use runtime::Runtime;
use write_queue::Chunk;

/// An ordered multi-map. Response headers go out exactly in insertion
/// order; lookups are case-insensitive as HTTP requires.
pub struct Headers {
    items: Vec<(String, String)>
}

impl Headers {
    pub fn new() -> Headers {
        Headers { items: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items.iter()
            .find(|&&(ref k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    /// Replaces any previous value under the same name.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(item) = self.items.iter_mut().find(|&&mut (ref k, _)| k.eq_ignore_ascii_case(name)) {
            item.1.clear();
            item.1.push_str(value);
            return;
        }
        self.items.push((name.to_owned(), value.to_owned()));
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.items.push((name.to_owned(), value.to_owned()));
    }

    pub fn iter(&self) -> ::std::slice::Iter<(String, String)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Where a request body landed: small ones stay in memory, large ones
/// spill to an unlinked temporary file.
pub enum Body {
    Empty,
    Ram(Vec<u8>),
    Spilled(fs::File, u64)
}

impl Body {
    pub fn len(&self) -> u64 {
        match *self {
            Body::Empty => 0,
            Body::Ram(ref buf) => buf.len() as u64,
            Body::Spilled(_, len) => len
        }
    }
}

pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub minor_version: u8,
    pub headers: Headers,
    pub body: Body,
    pub received_at: time::Timespec,
    pub status: u16,
    pub out_headers: Headers,
    uuid: Uuid,
    keep_alive: bool,
    replied: bool,
    upgraded: bool,
    streaming: bool,
    leftover: Vec<u8>
}

impl Request {
    pub fn new(uuid: Uuid) -> Request {
        Request {
            method: String::new(),
            path: String::new(),
            query: None,
            minor_version: 1,
            headers: Headers::new(),
            body: Body::Empty,
            received_at: time::get_time(),
            status: 200,
            out_headers: Headers::new(),
            uuid: uuid,
            keep_alive: true,
            replied: false,
            upgraded: false,
            streaming: false,
            leftover: Vec::new()
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The value of one cookie, parsed out of the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.headers.get("cookie")?;

        for pair in header.split(';') {
            let pair = pair.trim();
            let mut split = pair.splitn(2, '=');

            match (split.next(), split.next()) {
                (Some(k), Some(v)) if k == name => return Some(v.to_owned()),
                _ => ()
            }
        }
        None
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.out_headers.set(name, value);
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// True once a response (or an upgrade) went out.
    pub fn replied(&self) -> bool {
        self.replied || self.upgraded
    }

    pub fn upgraded(&self) -> bool {
        self.upgraded
    }

    /// The protocol was swapped out from under the codec.
    pub fn mark_upgraded(&mut self) {
        self.upgraded = true;
    }

    /// Bytes that arrived in the same read cycle as this request but
    /// past its end. An accepted upgrade takes them along so the first
    /// frames of the new protocol are not lost.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        ::std::mem::replace(&mut self.leftover, Vec::new())
    }

    pub fn set_leftover(&mut self, bytes: Vec<u8>) {
        self.leftover = bytes;
    }

    /// Whether the connection must close after this exchange.
    pub fn wants_close(&self) -> bool {
        if self.upgraded {
            return false;
        }
        match self.headers.get("connection") {
            Some(value) => contains_token(value, "close"),
            None => self.minor_version == 0
        }
    }

    /// One-shot response with a `Content-Length` body.
    pub fn send(&mut self, rt: &Runtime, body: &[u8]) -> SockResult<()> {
        if self.replied() {
            return Ok(());
        }

        let mut head = self.render_head(Some(body.len() as u64), false);

        head.extend_from_slice(body);
        self.replied = true;
        rt.write(self.uuid, head)
    }

    /// Responds with a file region, routed through the queue's
    /// zero-copy path.
    pub fn sendfile(&mut self, rt: &Runtime, file: fs::File, offset: u64, len: u64) -> SockResult<()> {
        if self.replied() {
            return Ok(());
        }

        let head = self.render_head(Some(len), false);

        self.replied = true;
        rt.write(self.uuid, head)?;
        rt.write_chunk(self.uuid, Chunk::File { file: file, offset: offset, len: len })
    }

    /// Sends the status line and headers alone. The upgrade paths use
    /// it for the `101` that precedes the protocol swap.
    pub fn send_head(&mut self, rt: &Runtime) -> SockResult<()> {
        if self.replied() {
            return Ok(());
        }

        let head = self.render_head(None, false);

        self.replied = true;
        rt.write(self.uuid, head)
    }

    /// Starts a chunked response; follow with `stream` and
    /// `finish_stream`.
    pub fn begin_stream(&mut self, rt: &Runtime) -> SockResult<()> {
        if self.replied() {
            return Ok(());
        }

        let head = self.render_head(None, true);

        self.replied = true;
        self.streaming = true;
        rt.write(self.uuid, head)
    }

    pub fn stream(&mut self, rt: &Runtime, data: &[u8]) -> SockResult<()> {
        if !self.streaming || data.is_empty() {
            return Ok(());
        }
        rt.write(self.uuid, chunk_encode(data))
    }

    pub fn finish_stream(&mut self, rt: &Runtime) -> SockResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        rt.write(self.uuid, b"0\r\n\r\n".to_vec())
    }

    fn render_head(&self, content_length: Option<u64>, chunked: bool) -> Vec<u8> {
        let mut head = Vec::with_capacity(256);
        let reason = status_text(self.status);

        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status, reason);
        let _ = write!(head, "Date: {}\r\n", http_date());

        if self.status != 101 {
            let token = if self.keep_alive && !self.wants_close() { "keep-alive" } else { "close" };

            let _ = write!(head, "Connection: {}\r\n", token);
        }
        if chunked {
            head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = content_length {
            let _ = write!(head, "Content-Length: {}\r\n", len);
        }
        for &(ref name, ref value) in self.out_headers.iter() {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

/// One chunked-transfer chunk: hex size, CRLF, data, CRLF.
pub fn chunk_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);

    let _ = write!(out, "{:x}\r\n", data.len());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Case-insensitive scan of a comma separated header value.
pub fn contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown"
    }
}

const DAY_NAMES: [&'static str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&'static str; 12] =
    ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

pub fn http_date() -> String {
    let tm = time::now_utc();

    format!("{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
            DAY_NAMES[tm.tm_wday as usize],
            tm.tm_mday,
            MONTH_NAMES[tm.tm_mon as usize],
            1900 + tm.tm_year,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let mut headers = Headers::new();

        headers.set("Content-Type", "text/plain");
        assert_eq!(Some("text/plain"), headers.get("content-type"));
        headers.set("content-TYPE", "text/html");
        assert_eq!(Some("text/html"), headers.get("Content-Type"));
        assert_eq!(1, headers.len());
    }

    #[test]
    fn connection_tokens() {
        assert!(contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(contains_token("close", "close"));
        assert!(!contains_token("keep-alive", "close"));
    }

    #[test]
    fn chunks_are_hex_prefixed() {
        assert_eq!(b"5\r\nhello\r\n".to_vec(), chunk_encode(b"hello"));
        assert_eq!(b"10\r\n0123456789abcdef\r\n".to_vec(), chunk_encode(b"0123456789abcdef"));
    }
}
