//! chunked view over a non blocking socket
//!
//! `read_chunk` hands out whatever the socket has right now, and previously
//! consumed bytes can be pushed back in front of the next read with
//! `unconsume`, so a parse step can be re-driven. Pushback comes in two
//! flavors: a normal one, bounded by the most recent chunk, and a reset one
//! for hand-over re-drives, bounded by a per-stream budget so a buggy state
//! machine cannot loop on the same bytes forever.

use std::{cmp, collections::VecDeque};

use thiserror::Error;

use crate::{
    socket::{SocketHandler, SocketResult},
    timer::TimeoutContainer,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    #[error("pushed back {pushed} bytes but the last chunk was only {last} bytes")]
    OversizedPushback { pushed: usize, last: usize },
    #[error("reset budget exhausted ({limit} allowed)")]
    ResetBudgetExhausted { limit: u32 },
}

pub struct ChunkedStream<S: SocketHandler> {
    socket: S,
    replay: VecDeque<u8>,
    last_chunk: usize,
    resets: u32,
    reset_limit: u32,
    pub idle_timeout: TimeoutContainer,
    closing: bool,
}

impl<S: SocketHandler> ChunkedStream<S> {
    pub fn new(socket: S, idle_timeout: TimeoutContainer, reset_limit: u32) -> ChunkedStream<S> {
        ChunkedStream {
            socket,
            replay: VecDeque::new(),
            last_chunk: 0,
            resets: 0,
            reset_limit,
            idle_timeout,
            closing: false,
        }
    }

    /// reads whatever is available right now: replayed bytes first, then the
    /// socket; `(0, Closed)` means the peer closed (or the idle close was
    /// finalized once the replay drained)
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        if !self.replay.is_empty() {
            let len = cmp::min(buf.len(), self.replay.len());
            for (i, byte) in self.replay.drain(..len).enumerate() {
                buf[i] = byte;
            }
            self.last_chunk = len;
            return (len, SocketResult::Continue);
        }

        if self.closing {
            return (0, SocketResult::Closed);
        }

        let (size, res) = self.socket.socket_read(buf);
        if size > 0 {
            self.last_chunk = size;
            self.idle_timeout.reset();
        }
        (size, res)
    }

    pub fn write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        if self.closing {
            return (0, SocketResult::Closed);
        }
        let (size, res) = self.socket.socket_write(buf);
        if size > 0 {
            self.idle_timeout.reset();
        }
        (size, res)
    }

    /// pushes bytes back in front of the read buffer so a later parse can
    /// re-read them
    pub fn unconsume(&mut self, bytes: &[u8], allow_reset: bool) -> Result<(), StreamError> {
        if bytes.is_empty() {
            return Ok(());
        }

        if allow_reset {
            if self.resets >= self.reset_limit {
                return Err(StreamError::ResetBudgetExhausted {
                    limit: self.reset_limit,
                });
            }
            self.resets += 1;
        } else if bytes.len() > self.last_chunk {
            return Err(StreamError::OversizedPushback {
                pushed: bytes.len(),
                last: self.last_chunk,
            });
        }

        for byte in bytes.iter().rev() {
            self.replay.push_front(*byte);
        }
        Ok(())
    }

    /// unread pushed back bytes remain; an idle upstream connection may only
    /// be dropped when this is false
    pub fn data_available(&self) -> bool {
        !self.replay.is_empty()
    }

    /// the idle timer fired; buffered data is still delivered before the
    /// close is finalized. Returns true if the stream can be closed now.
    pub fn idle_expired(&mut self) -> bool {
        self.idle_timeout.triggered();
        self.closing = true;
        !self.data_available()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn socket_ref(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// releases the raw socket and whatever was pushed back on it, for
    /// hand-over to an external owner
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        self.idle_timeout.cancel();
        (self.socket, self.replay.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSocket {
        input: Vec<u8>,
        position: usize,
        output: Vec<u8>,
    }

    impl StaticSocket {
        fn with_input(input: &[u8]) -> StaticSocket {
            StaticSocket {
                input: input.to_vec(),
                position: 0,
                output: Vec::new(),
            }
        }
    }

    impl SocketHandler for StaticSocket {
        fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
            let available = &self.input[self.position..];
            if available.is_empty() {
                return (0, SocketResult::WouldBlock);
            }
            let len = cmp::min(buf.len(), available.len());
            buf[..len].copy_from_slice(&available[..len]);
            self.position += len;
            (len, SocketResult::Continue)
        }

        fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
            self.output.extend_from_slice(buf);
            (buf.len(), SocketResult::Continue)
        }
    }

    fn stream(input: &[u8]) -> ChunkedStream<StaticSocket> {
        ChunkedStream::new(
            StaticSocket::with_input(input),
            TimeoutContainer::new_empty(std::time::Duration::from_secs(60)),
            1,
        )
    }

    #[test]
    fn chunk_then_would_block() {
        let mut s = stream(b"hello");
        let mut buf = [0u8; 16];

        let (sz, res) = s.read_chunk(&mut buf);
        assert_eq!((sz, res), (5, SocketResult::Continue));
        assert_eq!(&buf[..sz], b"hello");

        let (sz, res) = s.read_chunk(&mut buf);
        assert_eq!((sz, res), (0, SocketResult::WouldBlock));
    }

    #[test]
    fn unconsume_reproduces_bytes() {
        let mut s = stream(b"abcdef");
        let mut buf = [0u8; 16];

        let (sz, _) = s.read_chunk(&mut buf);
        assert_eq!(&buf[..sz], b"abcdef");

        s.unconsume(b"cdef", false).expect("bounded pushback");
        assert!(s.data_available());

        let (sz, res) = s.read_chunk(&mut buf);
        assert_eq!(res, SocketResult::Continue);
        assert_eq!(&buf[..sz], b"cdef");
        assert!(!s.data_available());
    }

    #[test]
    fn oversized_pushback_rejected() {
        let mut s = stream(b"ab");
        let mut buf = [0u8; 16];
        let _ = s.read_chunk(&mut buf);

        assert_eq!(
            s.unconsume(b"abcdef", false),
            Err(StreamError::OversizedPushback {
                pushed: 6,
                last: 2,
            })
        );
    }

    #[test]
    fn reset_budget_is_one_by_default() {
        let mut s = stream(b"ab");
        let mut buf = [0u8; 16];
        let _ = s.read_chunk(&mut buf);

        s.unconsume(b"a much larger block than the last chunk", true)
            .expect("first reset allowed");
        let mut big = [0u8; 64];
        let (sz, _) = s.read_chunk(&mut big);
        assert!(sz > 0);

        assert_eq!(
            s.unconsume(b"again", true),
            Err(StreamError::ResetBudgetExhausted { limit: 1 })
        );
    }

    #[test]
    fn idle_close_delivers_buffered_bytes_first() {
        let mut s = stream(b"tail");
        let mut buf = [0u8; 16];
        let (sz, _) = s.read_chunk(&mut buf);
        s.unconsume(&buf[..sz], false).unwrap();

        // timer fired while pushed back data was pending
        assert!(!s.idle_expired());

        let (sz, res) = s.read_chunk(&mut buf);
        assert_eq!(res, SocketResult::Continue);
        assert_eq!(&buf[..sz], b"tail");

        let (sz, res) = s.read_chunk(&mut buf);
        assert_eq!((sz, res), (0, SocketResult::Closed));
    }
}
