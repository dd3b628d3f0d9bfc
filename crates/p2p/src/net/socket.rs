//! Buffered socket wrapper used by the reactor.
use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::Link;

/// A socket with an outbound write queue.
///
/// Writes are queued with [`Socket::push`] and flushed when the underlying
/// stream is ready, so the reactor never blocks on a slow peer.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// Remote address of the socket.
    pub addr: net::SocketAddr,
    /// Whether the connection is inbound or outbound.
    pub link: Link,
    /// Queued writes, with the write offset into the front buffer.
    out: VecDeque<Vec<u8>>,
    offset: usize,
}

impl<R: Read + Write> Socket<R> {
    /// Wrap a raw stream.
    pub fn from(raw: R, addr: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            addr,
            link,
            out: VecDeque::new(),
            offset: 0,
        }
    }

    /// Queue bytes to be sent to the remote.
    pub fn push(&mut self, bytes: &[u8]) {
        self.out.push_back(bytes.to_vec());
    }

    /// Write as much of the queue as the stream accepts. Returns
    /// `WouldBlock` when the stream can't take more, with the remainder left
    /// queued for the next writable event.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(buf) = self.out.front() {
            match self.raw.write(&buf[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;

                    if self.offset == buf.len() {
                        self.out.pop_front();
                        self.offset = 0;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }
}

impl<R: Read> Read for Socket<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

impl Socket<net::TcpStream> {
    /// Local address of the socket.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut the connection down, dropping any queued writes.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stream that accepts a bounded number of bytes per write, then blocks.
    struct Sink {
        written: Vec<u8>,
        accept: usize,
    }

    impl Read for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = usize::min(self.accept, buf.len());

            self.written.extend_from_slice(&buf[..n]);
            self.accept -= n;

            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn socket(accept: usize) -> Socket<Sink> {
        Socket::from(
            Sink {
                written: Vec::new(),
                accept,
            },
            ([127, 0, 0, 1], 8333).into(),
            Link::Outbound,
        )
    }

    #[test]
    fn test_flush_drains_queue() {
        let mut socket = socket(16);

        socket.push(b"hello");
        socket.push(b"world");
        socket.flush().unwrap();

        assert_eq!(socket.raw.written, b"helloworld");
        assert!(socket.out.is_empty());
    }

    #[test]
    fn test_flush_resumes_partial_writes() {
        let mut socket = socket(3);

        socket.push(b"hello");
        let err = socket.flush().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(socket.raw.written, b"hel");

        // The stream became writable again.
        socket.raw.accept = 16;
        socket.flush().unwrap();

        assert_eq!(socket.raw.written, b"hello");
        assert!(socket.out.is_empty());
    }
}
