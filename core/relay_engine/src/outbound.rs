//! Bounded outbound byte buffer for non-blocking stream writes
//!
//! Dispatch callbacks must never block, so stream sockets are written in
//! non-blocking mode. Whatever the kernel does not accept right away is kept
//! here, in order, and flushed ahead of the next chunk. If the backlog would
//! exceed the limit the destination is considered stalled and the write fails;
//! the caller then tears the connection down, which frees the buffer.

use std::collections::VecDeque;
use std::io::{self, Write};

/// Default backlog limit per stream destination
pub const DEFAULT_OUTBOUND_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub struct OutboundBuffer {
    pending: VecDeque<u8>,
    limit: usize,
}

impl OutboundBuffer {
    pub fn new(limit: usize) -> Self {
        OutboundBuffer {
            pending: VecDeque::new(),
            limit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Flush the backlog, then write `chunk`, queueing what does not fit.
    ///
    /// Returns the number of bytes the writer accepted during this call.
    pub fn send<W: Write>(&mut self, writer: &mut W, chunk: &[u8]) -> io::Result<usize> {
        let mut written = self.flush(writer)?;

        let mut rest = chunk;
        if self.pending.is_empty() {
            while !rest.is_empty() {
                match writer.write(rest) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        written += n;
                        rest = &rest[n..];
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        if !rest.is_empty() {
            if self.pending.len() + rest.len() > self.limit {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("outbound backlog over {} bytes", self.limit),
                ));
            }
            self.pending.extend(rest);
        }

        Ok(written)
    }

    /// Write as much of the backlog as the writer accepts.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while !self.pending.is_empty() {
            let (front, _) = self.pending.as_slices();
            match writer.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer accepting at most `budget` bytes before reporting WouldBlock
    struct Throttled {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unthrottled_write_passes_through() {
        let mut w = Throttled { out: Vec::new(), budget: usize::MAX };
        let mut buf = OutboundBuffer::new(16);
        assert_eq!(buf.send(&mut w, b"hello").unwrap(), 5);
        assert!(buf.is_empty());
        assert_eq!(w.out, b"hello");
    }

    #[test]
    fn test_backlog_preserves_order() {
        let mut w = Throttled { out: Vec::new(), budget: 3 };
        let mut buf = OutboundBuffer::new(64);

        assert_eq!(buf.send(&mut w, b"abcdef").unwrap(), 3);
        assert_eq!(buf.len(), 3);

        // Still blocked: new bytes queue behind the backlog
        assert_eq!(buf.send(&mut w, b"gh").unwrap(), 0);
        assert_eq!(buf.len(), 5);

        w.budget = usize::MAX;
        assert_eq!(buf.send(&mut w, b"ij").unwrap(), 7);
        assert!(buf.is_empty());
        assert_eq!(w.out, b"abcdefghij");
    }

    #[test]
    fn test_overflow_fails() {
        let mut w = Throttled { out: Vec::new(), budget: 0 };
        let mut buf = OutboundBuffer::new(4);
        assert!(buf.send(&mut w, b"abcd").is_ok());
        assert!(buf.send(&mut w, b"e").is_err());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_hard_error_propagates() {
        let mut buf = OutboundBuffer::new(4);
        let err = buf.send(&mut Broken, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
