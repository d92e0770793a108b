// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The streaming request parser: request heads through httparse, body
/// framing (content-length and chunked) by hand. Everything is bounded;
/// a request crossing any limit is a protocol error that costs the peer
/// its connection. Bodies beyond the in-memory threshold spill to an
/// unlinked temporary file.

use std::fs;
use std::io;
use std::io::{Seek, Write};
use std::str;

use httparse;

use libc;

use global::Uuid;
use http::request::{Body, Request};

/// What the codec should answer when parsing fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// 400
    Malformed,
    /// 431
    HeadTooLarge,
    /// 413
    BodyTooLarge,
    /// 500, a local failure (body spill)
    Internal
}

pub struct Limits {
    pub max_head: usize,
    pub max_headers: usize,
    pub max_body: u64,
    pub body_memory: usize
}

enum State {
    Head,
    Body { request: Request, remaining: u64 },
    Chunked { request: Request, step: ChunkStep }
}

enum ChunkStep {
    Size,
    Data(u64),
    DataEnd,
    Trailer
}

pub struct Parser {
    buf: Vec<u8>,
    state: State
}

const MAX_METHOD: usize = 16;

impl Parser {
    pub fn new() -> Parser {
        Parser {
            buf: Vec::new(),
            state: State::Head
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Hands back whatever followed the last complete request. Upgrades
    /// use it: a client may glue its first frames to the handshake, and
    /// those bytes belong to the protocol taking the connection over.
    /// Only meaningful between requests, never mid-body.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        ::std::mem::replace(&mut self.buf, Vec::new())
    }

    /// The next complete request, if the buffer holds one. Pipelined
    /// requests come out one call at a time.
    pub fn next(&mut self, uuid: Uuid, limits: &Limits) -> Result<Option<Request>, ParseError> {
        loop {
            let state = ::std::mem::replace(&mut self.state, State::Head);

            match state {
                State::Head => {
                    match self.parse_head(uuid, limits)? {
                        Some(next) => self.state = next,
                        None => return Ok(None)
                    }
                }
                State::Body { mut request, remaining } => {
                    let taken = ::std::cmp::min(remaining, self.buf.len() as u64) as usize;

                    if taken > 0 {
                        append_body(&mut request, &self.buf[..taken], limits)?;
                        self.buf.drain(..taken);
                    }
                    if remaining > taken as u64 {
                        self.state = State::Body { request: request, remaining: remaining - taken as u64 };
                        return Ok(None);
                    }
                    rewind_body(&mut request)?;
                    return Ok(Some(request));
                }
                State::Chunked { mut request, step } => {
                    match self.parse_chunked(&mut request, step, limits)? {
                        Some(step) => {
                            self.state = State::Chunked { request: request, step: step };
                            return Ok(None);
                        }
                        None => {
                            rewind_body(&mut request)?;
                            return Ok(Some(request));
                        }
                    }
                }
            }
        }
    }

    // Ok(None): need more bytes. Ok(Some(state)): head finished.
    fn parse_head(&mut self, uuid: Uuid, limits: &Limits) -> Result<Option<State>, ParseError> {
        let (request, head_len) = {
            let mut header_slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
            let mut parsed = httparse::Request::new(&mut header_slots);

            match parsed.parse(&self.buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    if head_len > limits.max_head {
                        return Err(ParseError::HeadTooLarge);
                    }

                    let mut request = Request::new(uuid);
                    let method = parsed.method.unwrap_or("");

                    if method.is_empty() || method.len() > MAX_METHOD {
                        return Err(ParseError::Malformed);
                    }
                    request.method = method.to_owned();

                    let target = parsed.path.unwrap_or("/");

                    match target.find('?') {
                        Some(at) => {
                            request.path = target[..at].to_owned();
                            request.query = Some(target[at + 1..].to_owned());
                        }
                        None => request.path = target.to_owned()
                    }
                    request.minor_version = parsed.version.unwrap_or(1);

                    for header in parsed.headers.iter() {
                        let value = str::from_utf8(header.value).map_err(|_| ParseError::Malformed)?;

                        request.headers.add(header.name, value);
                    }
                    (request, head_len)
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > limits.max_head {
                        return Err(ParseError::HeadTooLarge);
                    }
                    return Ok(None);
                }
                Err(httparse::Error::TooManyHeaders) => return Err(ParseError::HeadTooLarge),
                Err(_) => return Err(ParseError::Malformed)
            }
        };

        self.buf.drain(..head_len);

        if is_chunked(&request) {
            return Ok(Some(State::Chunked { request: request, step: ChunkStep::Size }));
        }

        let length = match content_length(&request) {
            Ok(length) => length,
            Err(_) => return Err(ParseError::Malformed)
        };

        if length > limits.max_body {
            return Err(ParseError::BodyTooLarge);
        }
        Ok(Some(State::Body { request: request, remaining: length }))
    }

    // Ok(Some(step)): need more bytes, resume there. Ok(None): body done.
    fn parse_chunked(&mut self,
                     request: &mut Request,
                     mut step: ChunkStep,
                     limits: &Limits) -> Result<Option<ChunkStep>, ParseError> {
        loop {
            match step {
                ChunkStep::Size => {
                    let line_end = match find_crlf(&self.buf) {
                        Some(at) => at,
                        None => {
                            if self.buf.len() > 1024 {
                                return Err(ParseError::Malformed);
                            }
                            return Ok(Some(ChunkStep::Size));
                        }
                    };
                    let size = {
                        let line = str::from_utf8(&self.buf[..line_end]).map_err(|_| ParseError::Malformed)?;
                        let digits = line.split(';').next().unwrap_or("").trim();

                        u64::from_str_radix(digits, 16).map_err(|_| ParseError::Malformed)?
                    };

                    self.buf.drain(..line_end + 2);
                    if request.body.len() + size > limits.max_body {
                        return Err(ParseError::BodyTooLarge);
                    }
                    step = if size == 0 { ChunkStep::Trailer } else { ChunkStep::Data(size) };
                }
                ChunkStep::Data(remaining) => {
                    let taken = ::std::cmp::min(remaining, self.buf.len() as u64) as usize;

                    if taken > 0 {
                        {
                            let slice = &self.buf[..taken];

                            append_body(request, slice, limits)?;
                        }
                        self.buf.drain(..taken);
                    }
                    if remaining > taken as u64 {
                        return Ok(Some(ChunkStep::Data(remaining - taken as u64)));
                    }
                    step = ChunkStep::DataEnd;
                }
                ChunkStep::DataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(Some(ChunkStep::DataEnd));
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::Malformed);
                    }
                    self.buf.drain(..2);
                    step = ChunkStep::Size;
                }
                ChunkStep::Trailer => {
                    // trailers are skipped up to the final empty line
                    match find_crlf(&self.buf) {
                        None => return Ok(Some(ChunkStep::Trailer)),
                        Some(0) => {
                            self.buf.drain(..2);
                            return Ok(None);
                        }
                        Some(at) => {
                            self.buf.drain(..at + 2);
                            step = ChunkStep::Trailer;
                        }
                    }
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn is_chunked(request: &Request) -> bool {
    match request.headers.get("transfer-encoding") {
        Some(value) => ::http::request::contains_token(value, "chunked"),
        None => false
    }
}

fn content_length(request: &Request) -> Result<u64, ()> {
    match request.headers.get("content-length") {
        Some(value) => value.trim().parse::<u64>().map_err(|_| ()),
        None => Ok(0)
    }
}

fn append_body(request: &mut Request, bytes: &[u8], limits: &Limits) -> Result<(), ParseError> {
    if request.body.len() + bytes.len() as u64 > limits.max_body {
        return Err(ParseError::BodyTooLarge);
    }

    let spill = match request.body {
        Body::Empty => {
            if bytes.len() > limits.body_memory {
                true
            } else {
                request.body = Body::Ram(bytes.to_vec());
                return Ok(());
            }
        }
        Body::Ram(ref mut buf) => {
            if buf.len() + bytes.len() > limits.body_memory {
                true
            } else {
                buf.extend_from_slice(bytes);
                return Ok(());
            }
        }
        Body::Spilled(ref mut file, ref mut len) => {
            file.write_all(bytes).map_err(|_| ParseError::Internal)?;
            *len += bytes.len() as u64;
            return Ok(());
        }
    };

    if spill {
        spill_body(request, bytes).map_err(|_| ParseError::Internal)?;
    }
    Ok(())
}

fn spill_body(request: &mut Request, bytes: &[u8]) -> io::Result<()> {
    let mut file = tmpfile()?;
    let mut len = 0u64;

    if let Body::Ram(ref buf) = request.body {
        file.write_all(buf)?;
        len += buf.len() as u64;
    }
    file.write_all(bytes)?;
    len += bytes.len() as u64;
    request.body = Body::Spilled(file, len);
    Ok(())
}

fn rewind_body(request: &mut Request) -> Result<(), ParseError> {
    if let Body::Spilled(ref mut file, _) = request.body {
        file.seek(io::SeekFrom::Start(0)).map_err(|_| ParseError::Internal)?;
    }
    Ok(())
}

/// An anonymous temporary file: created with `mkstemp`, unlinked right
/// away, gone when the descriptor closes.
pub fn tmpfile() -> io::Result<fs::File> {
    use std::ffi::CString;
    use std::os::unix::io::FromRawFd;

    let mut template = ::std::env::temp_dir();

    template.push("evio_body_XXXXXX");

    let path = CString::new(template.to_str().unwrap_or("/tmp/evio_body_XXXXXX"))
        .map_err(|_| ::global::invalid_input_io_error("bad tmp path"))?;
    let raw = path.into_raw();
    let fd = unsafe { libc::mkstemp(raw) };
    let path = unsafe { CString::from_raw(raw) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::unlink(path.as_ptr());
        Ok(fs::File::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use global::Uuid;
    use http::request::Body;

    use super::*;

    fn limits() -> Limits {
        Limits {
            max_head: 8 * 1024,
            max_headers: 64,
            max_body: 1024 * 1024,
            body_memory: 64
        }
    }

    fn uuid() -> Uuid {
        Uuid::compose(9, 0)
    }

    #[test]
    fn parses_a_plain_get() {
        let mut parser = Parser::new();

        parser.feed(b"GET /hello?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n");

        let request = parser.next(uuid(), &limits()).unwrap().unwrap();

        assert_eq!("GET", request.method);
        assert_eq!("/hello", request.path);
        assert_eq!(Some("x=1".to_owned()), request.query);
        assert_eq!(Some("localhost"), request.header("host"));
        assert_eq!(0, request.body.len());
        assert!(parser.next(uuid(), &limits()).unwrap().is_none());
    }

    #[test]
    fn content_length_body_roundtrips() {
        let mut parser = Parser::new();

        parser.feed(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
        assert!(parser.next(uuid(), &limits()).unwrap().is_none());
        parser.feed(b"lo");

        let request = parser.next(uuid(), &limits()).unwrap().unwrap();

        match request.body {
            Body::Ram(ref buf) => assert_eq!(b"hello".to_vec(), *buf),
            _ => panic!("expected an in-memory body")
        }
    }

    #[test]
    fn chunked_body_roundtrips() {
        let mut parser = Parser::new();

        parser.feed(b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        parser.feed(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");

        let request = parser.next(uuid(), &limits()).unwrap().unwrap();

        match request.body {
            Body::Ram(ref buf) => assert_eq!(b"hello world".to_vec(), *buf),
            _ => panic!("expected an in-memory body")
        }
    }

    #[test]
    fn trailing_bytes_survive_for_the_next_protocol() {
        let mut parser = Parser::new();

        parser.feed(b"GET /live HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x82\x02hi");

        let request = parser.next(uuid(), &limits()).unwrap().unwrap();

        assert_eq!("/live", request.path);
        assert_eq!(b"\x82\x02hi".to_vec(), parser.take_buffered());
        assert_eq!(0, parser.buffered());
    }

    #[test]
    fn pipelined_requests_come_out_in_turn() {
        let mut parser = Parser::new();

        parser.feed(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");

        assert_eq!("/a", parser.next(uuid(), &limits()).unwrap().unwrap().path);
        assert_eq!("/b", parser.next(uuid(), &limits()).unwrap().unwrap().path);
        assert!(parser.next(uuid(), &limits()).unwrap().is_none());
    }

    #[test]
    fn big_bodies_spill_to_disk() {
        let mut parser = Parser::new();
        let body = vec![b'x'; 300];

        parser.feed(format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).as_bytes());
        parser.feed(&body);

        let request = parser.next(uuid(), &limits()).unwrap().unwrap();

        match request.body {
            Body::Spilled(mut file, len) => {
                let mut read_back = Vec::new();

                assert_eq!(300, len);
                file.read_to_end(&mut read_back).unwrap();
                assert_eq!(body, read_back);
            }
            _ => panic!("expected a spilled body")
        }
    }

    #[test]
    fn oversized_heads_are_rejected() {
        let mut parser = Parser::new();
        let mut huge = b"GET / HTTP/1.1\r\n".to_vec();

        for n in 0..600 {
            huge.extend_from_slice(format!("X-Pad-{}: {}\r\n", n, "y".repeat(32)).as_bytes());
        }
        parser.feed(&huge);

        match parser.next(uuid(), &limits()) {
            Err(ParseError::HeadTooLarge) => (),
            other => panic!("expected HeadTooLarge, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let mut parser = Parser::new();

        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 9999999999\r\n\r\n");

        match parser.next(uuid(), &limits()) {
            Err(ParseError::BodyTooLarge) => (),
            other => panic!("expected BodyTooLarge, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn overlong_methods_are_rejected() {
        let mut parser = Parser::new();

        parser.feed(b"ABCDEFGHIJKLMNOPQ / HTTP/1.1\r\nHost: x\r\n\r\n");

        match parser.next(uuid(), &limits()) {
            Err(ParseError::Malformed) => (),
            other => panic!("expected Malformed, got {:?}", other.map(|_| ()))
        }
    }
}
