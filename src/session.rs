//! Byte-stream plumbing and acknowledgement discipline for one session
//!
//! A `Session` owns the two halves of the transport plus the run options,
//! so both roles (and the tests) can drive the protocol over any
//! reader/writer pair.

use std::io::{ErrorKind, Read, Write};

use crate::errors::CopyError;
use crate::logger::Logger;
use crate::protocol::{self, ACK_OK, ERR_FATAL, ERR_SOFT, MAX_LINE_LEN, PROTOCOL_ERROR};
use crate::SessionOpts;

/// Running totals for the files and payload bytes that completed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub files: u64,
    pub bytes: u64,
}

pub struct Session<R, W> {
    reader: R,
    writer: W,
    pub opts: SessionOpts,
    pub log: Box<dyn Logger>,
    pub stats: TransferStats,
}

impl<R: Read, W: Write> Session<R, W> {
    pub fn new(reader: R, writer: W, opts: SessionOpts, log: Box<dyn Logger>) -> Self {
        Session {
            reader,
            writer,
            opts,
            log,
            stats: TransferStats::default(),
        }
    }

    /// Read one byte; `None` is end of stream. Any I/O failure is fatal.
    pub fn read_byte(&mut self) -> Result<Option<u8>, CopyError> {
        let mut b = [0u8; 1];
        loop {
            match self.reader.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(b[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::fatal(e.to_string())),
            }
        }
    }

    /// Read up to (and excluding) the next newline. EOF mid-line and
    /// oversized lines are both fatal.
    pub fn read_line(&mut self) -> Result<String, CopyError> {
        let mut line = Vec::with_capacity(64);
        loop {
            match self.read_byte()? {
                None => return Err(CopyError::fatal("unexpected end of stream")),
                Some(b'\n') => break,
                Some(b) => {
                    if line.len() == MAX_LINE_LEN {
                        return Err(CopyError::fatal("line too long"));
                    }
                    line.push(b);
                }
            }
        }
        String::from_utf8(line).map_err(|_| CopyError::fatal("invalid utf-8 on stream"))
    }

    /// Raw chunk read for payload bytes. 0 means end of stream.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, CopyError> {
        loop {
            match self.reader.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::fatal(e.to_string())),
            }
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), CopyError> {
        self.writer
            .write_all(buf)
            .map_err(|e| CopyError::fatal(e.to_string()))
    }

    /// Push anything buffered down to the peer. Required before every
    /// blocking read; the peer acts only on bytes it has seen.
    pub fn flush(&mut self) -> Result<(), CopyError> {
        self.writer
            .flush()
            .map_err(|e| CopyError::fatal(e.to_string()))
    }

    /// Write one newline-terminated frame line and flush it.
    pub fn write_line(&mut self, line: &str) -> Result<(), CopyError> {
        self.write_all(line.as_bytes())?;
        self.write_all(b"\n")?;
        self.flush()
    }

    /// Success acknowledgement.
    pub fn write_ok(&mut self) -> Result<(), CopyError> {
        self.write_all(&[ACK_OK])?;
        self.flush()
    }

    /// Read the peer's one-byte verdict; error markers carry a message line.
    pub fn read_ack(&mut self) -> Result<(), CopyError> {
        match self.read_byte()? {
            None => Err(CopyError::fatal("unexpected end of stream")),
            Some(ACK_OK) => Ok(()),
            Some(ERR_SOFT) => Err(CopyError::Soft(self.read_line()?)),
            Some(ERR_FATAL) => Err(CopyError::Fatal(self.read_line()?)),
            Some(_) => Err(CopyError::fatal(PROTOCOL_ERROR)),
        }
    }

    /// Report an error to the peer, best effort. The marker byte matches
    /// the error's kind; the message is flattened and clamped.
    pub fn send_error(&mut self, err: &CopyError) {
        let marker = if err.is_fatal() { ERR_FATAL } else { ERR_SOFT };
        let line = protocol::error_line(&err.to_string());
        let _ = self.writer.write_all(&[marker]);
        let _ = self.writer.write_all(line.as_bytes());
        let _ = self.writer.write_all(b"\n");
        let _ = self.writer.flush();
    }

    /// Report an error to the peer and hand it back for local accounting.
    pub fn tee(&mut self, err: CopyError) -> CopyError {
        self.log.error(&err.to_string());
        self.send_error(&err);
        err
    }

    /// Consume the session, yielding the writer (tests inspect the wire).
    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::io::Cursor;

    fn session(input: &[u8]) -> Session<Cursor<Vec<u8>>, Vec<u8>> {
        Session::new(
            Cursor::new(input.to_vec()),
            Vec::new(),
            SessionOpts::default(),
            Box::new(NoopLogger),
        )
    }

    #[test]
    fn ack_success() {
        assert_eq!(session(b"\x00").read_ack(), Ok(()));
    }

    #[test]
    fn ack_soft_carries_line() {
        assert_eq!(
            session(b"\x01no such file\n").read_ack(),
            Err(CopyError::soft("no such file"))
        );
    }

    #[test]
    fn ack_fatal_carries_line() {
        assert_eq!(
            session(b"\x02broken\n").read_ack(),
            Err(CopyError::fatal("broken"))
        );
    }

    #[test]
    fn ack_unknown_byte_is_protocol_error() {
        assert_eq!(
            session(b"\x07").read_ack(),
            Err(CopyError::fatal(PROTOCOL_ERROR))
        );
    }

    #[test]
    fn ack_eof_is_fatal() {
        assert!(session(b"").read_ack().unwrap_err().is_fatal());
    }

    #[test]
    fn read_line_stops_at_newline() {
        let mut s = session(b"D0755 0 d\nrest");
        assert_eq!(s.read_line().unwrap(), "D0755 0 d");
        assert_eq!(s.read_byte().unwrap(), Some(b'r'));
    }

    #[test]
    fn read_line_caps_length() {
        let mut input = vec![b'a'; MAX_LINE_LEN + 1];
        input.push(b'\n');
        assert!(session(&input).read_line().is_err());
    }

    #[test]
    fn send_error_markers_match_kind() {
        let mut s = session(b"");
        s.send_error(&CopyError::soft("mild"));
        s.send_error(&CopyError::fatal("dead"));
        assert_eq!(s.writer, b"\x01mild\n\x02dead\n");
    }

    #[test]
    fn send_error_flattens_newlines() {
        let mut s = session(b"");
        s.send_error(&CopyError::soft("a\nb"));
        assert_eq!(s.writer, b"\x01a; b\n");
    }
}
