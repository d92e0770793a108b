// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The per-connection outgoing queue.
///
/// Bytes leave the socket in the exact order they were enqueued: a
/// memory chunk queued behind a file chunk never overtakes it. Partial
/// writes advance a cursor inside the head chunk; a completed chunk is
/// released (memory freed, file closed) before the next one is touched.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;

use iovec::IoVec;

use transport::Transport;

/// One unit of outgoing data, owned by the queue once enqueued.
pub enum Chunk {
    Mem(Vec<u8>),
    /// A region of an open file, streamed with the transport's zero-copy
    /// path where available. The file is closed when the region has been
    /// sent; pass a `try_clone` to keep it open.
    File {
        file: fs::File,
        offset: u64,
        len: u64
    }
}

impl Chunk {
    fn byte_count(&self) -> usize {
        match *self {
            Chunk::Mem(ref buf) => buf.len(),
            Chunk::File { len, .. } => len as usize
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flush {
    /// The queue is now empty.
    Drained,
    WouldBlock,
    /// The peer is gone.
    Closed,
    Error
}

enum Queued {
    Mem { buf: Vec<u8>, off: usize },
    File { file: fs::File, off: u64, remaining: u64 }
}

pub struct WriteQueue {
    chunks: VecDeque<Queued>,
    queued: usize,
    sealed: bool
}

// consecutive memory chunks gathered into a single writev call
const GATHER_MAX: usize = 8;

impl WriteQueue {
    pub fn new() -> WriteQueue {
        WriteQueue {
            chunks: VecDeque::new(),
            queued: 0,
            sealed: false
        }
    }

    /// Appends a chunk. Returns false when the queue has been sealed by
    /// a close: the chunk is released without ever touching the socket.
    pub fn enqueue(&mut self, chunk: Chunk) -> bool {
        if self.sealed || chunk.byte_count() == 0 {
            return !self.sealed;
        }

        self.queued += chunk.byte_count();
        self.chunks.push_back(match chunk {
            Chunk::Mem(buf) => Queued::Mem { buf: buf, off: 0 },
            Chunk::File { file, offset, len } => Queued::File { file: file, off: offset, remaining: len }
        });
        true
    }

    /// Refuses further chunks; what is already queued may still drain.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes not yet handed to the kernel.
    pub fn pending(&self) -> usize {
        self.queued
    }

    /// Writes as much as the socket accepts, from the reactor thread
    /// only. Stops at the first `EAGAIN`.
    pub fn flush(&mut self, stream: &mut Transport) -> Flush {
        loop {
            if self.chunks.is_empty() {
                return Flush::Drained;
            }

            let head_is_mem = match self.chunks[0] {
                Queued::Mem { .. } => true,
                Queued::File { .. } => false
            };
            let result = if head_is_mem {
                self.write_gathered(stream)
            } else {
                self.write_file(stream)
            };

            match result {
                Ok(0) => {
                    // a truncated file region; drop what cannot be read
                    self.drop_head();
                }
                Ok(n) => {
                    self.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Flush::WouldBlock;
                }
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe ||
                              e.kind() == io::ErrorKind::ConnectionReset => {
                    return Flush::Closed;
                }
                Err(e) => {
                    debug!("write queue error: '{:?}'", e);
                    return Flush::Error;
                }
            }
        }
    }

    fn write_gathered(&mut self, stream: &mut Transport) -> io::Result<usize> {
        let mut iovs: Vec<&IoVec> = Vec::with_capacity(GATHER_MAX);

        for queued in self.chunks.iter().take(GATHER_MAX) {
            match *queued {
                Queued::Mem { ref buf, off } => iovs.push((&buf[off..]).into()),
                Queued::File { .. } => break
            }
        }

        stream.writev(&iovs)
    }

    fn write_file(&mut self, stream: &mut Transport) -> io::Result<usize> {
        match self.chunks[0] {
            Queued::File { ref file, ref mut off, remaining } => {
                let count = ::std::cmp::min(remaining, usize::max_value() as u64) as usize;

                stream.sendfile(file.as_raw_fd(), off, count)
            }
            Queued::Mem { .. } => unreachable!()
        }
    }

    fn advance(&mut self, mut written: usize) {
        self.queued -= ::std::cmp::min(self.queued, written);

        while written > 0 {
            let done = match self.chunks[0] {
                Queued::Mem { ref buf, ref mut off } => {
                    let step = ::std::cmp::min(written, buf.len() - *off);

                    *off += step;
                    written -= step;
                    *off == buf.len()
                }
                Queued::File { ref mut remaining, .. } => {
                    let step = ::std::cmp::min(written as u64, *remaining);

                    *remaining -= step;
                    written -= step as usize;
                    *remaining == 0
                }
            };

            if done {
                self.chunks.pop_front();
            }
        }
    }

    fn drop_head(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            let left = match chunk {
                Queued::Mem { ref buf, off } => buf.len() - off,
                Queued::File { remaining, .. } => remaining as usize
            };

            self.queued -= ::std::cmp::min(self.queued, left);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::io;
    use std::io::{Read, Write};
    use std::os::unix::io::RawFd;

    use transport::Transport;

    use super::*;

    enum Step {
        Accept(usize),
        Eagain
    }

    struct TestStream {
        wrote: Vec<u8>,
        script: VecDeque<Step>
    }

    impl TestStream {
        fn unlimited() -> TestStream {
            TestStream { wrote: Vec::new(), script: VecDeque::new() }
        }

        fn scripted(steps: Vec<Step>) -> TestStream {
            TestStream { wrote: Vec::new(), script: steps.into_iter().collect() }
        }
    }

    impl Read for TestStream {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            unimplemented!();
        }
    }

    impl Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                None => {
                    self.wrote.extend_from_slice(buf);
                    Ok(buf.len())
                }
                Some(Step::Accept(n)) => {
                    let step = ::std::cmp::min(n, buf.len());

                    self.wrote.extend_from_slice(&buf[..step]);
                    Ok(step)
                }
                Some(Step::Eagain) => Err(io::Error::new(io::ErrorKind::WouldBlock, "busy"))
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for TestStream {
        fn fd(&self) -> RawFd {
            -1
        }
    }

    fn tmp_file(content: &[u8]) -> fs::File {
        use std::sync::atomic::{AtomicUsize, Ordering, ATOMIC_USIZE_INIT};

        static SEQ: AtomicUsize = ATOMIC_USIZE_INIT;

        let mut path = ::std::env::temp_dir();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);

        path.push(format!("evio-wq-{}-{}", unsafe { ::libc::getpid() }, seq));
        {
            let mut file = fs::File::create(&path).unwrap();

            file.write_all(content).unwrap();
        }

        let file = fs::File::open(&path).unwrap();

        fs::remove_file(&path).unwrap();
        file
    }

    #[test]
    fn bytes_leave_in_enqueue_order() {
        let mut queue = WriteQueue::new();
        let mut stream = TestStream::unlimited();

        queue.enqueue(Chunk::Mem(b"head ".to_vec()));
        queue.enqueue(Chunk::File { file: tmp_file(b"middle"), offset: 0, len: 6 });
        queue.enqueue(Chunk::Mem(b" tail".to_vec()));

        assert_eq!(Flush::Drained, queue.flush(&mut stream));
        assert_eq!(b"head middle tail".to_vec(), stream.wrote);
    }

    #[test]
    fn partial_writes_advance_the_cursor() {
        let mut queue = WriteQueue::new();
        let mut stream = TestStream::scripted(vec![Step::Accept(2), Step::Eagain, Step::Accept(10)]);

        queue.enqueue(Chunk::Mem(b"abcdef".to_vec()));

        assert_eq!(Flush::WouldBlock, queue.flush(&mut stream));
        assert_eq!(b"ab".to_vec(), stream.wrote);
        assert_eq!(4, queue.pending());

        assert_eq!(Flush::Drained, queue.flush(&mut stream));
        assert_eq!(b"abcdef".to_vec(), stream.wrote);
        assert_eq!(0, queue.pending());
    }

    #[test]
    fn file_region_respects_offset_and_len() {
        let mut queue = WriteQueue::new();
        let mut stream = TestStream::unlimited();

        queue.enqueue(Chunk::File { file: tmp_file(b"0123456789"), offset: 2, len: 5 });

        assert_eq!(Flush::Drained, queue.flush(&mut stream));
        assert_eq!(b"23456".to_vec(), stream.wrote);
    }

    #[test]
    fn sealed_queue_refuses_chunks() {
        let mut queue = WriteQueue::new();
        let mut stream = TestStream::unlimited();

        queue.enqueue(Chunk::Mem(b"kept".to_vec()));
        queue.seal();
        assert!(!queue.enqueue(Chunk::Mem(b"lost".to_vec())));

        assert_eq!(Flush::Drained, queue.flush(&mut stream));
        assert_eq!(b"kept".to_vec(), stream.wrote);
    }
}
