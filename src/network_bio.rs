//! In-memory transport byte buffer used by the TLS engine in place of a socket.
//!
//! The engine pulls ciphertext through [`BioReader`] and pushes ciphertext
//! through [`BioWriter`]; both are plain `std::io::{Read, Write}` impls, so
//! rustls' `read_tls()` / `write_tls()` work against this buffer exactly like
//! they would against a non-blocking socket. "No data yet" is reported as
//! `io::ErrorKind::WouldBlock`, which is the only retry signal the engine sees.
//!
//! The channel side feeds network bytes in with
//! [`NetworkBio::receive_from_network`] and drains ciphertext with
//! [`NetworkBio::take_outbound_ciphertext`].

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

/// TLS record header size (ContentType + ProtocolVersion + Length)
const TLS_RECORD_HEADER_SIZE: usize = 5;

/// Initial capacity of the outbound region; one full record plus header.
const OUTBOUND_INITIAL_CAPACITY: usize = 16384 + 2048 + TLS_RECORD_HEADER_SIZE;

/// Tracks where the engine is inside the inbound record stream.
///
/// Reads handed to the engine never cross a record boundary. Once the engine
/// stops reading (for example after it has seen close_notify), whatever
/// follows that record is still sitting in the inbound region and can be
/// handed back with [`NetworkBio::evacuate_unconsumed_inbound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordBoundary {
    Header {
        header: [u8; TLS_RECORD_HEADER_SIZE],
        seen: usize,
    },
    Payload {
        remaining: usize,
    },
}

impl RecordBoundary {
    fn start() -> Self {
        RecordBoundary::Header {
            header: [0u8; TLS_RECORD_HEADER_SIZE],
            seen: 0,
        }
    }

    /// Maximum number of bytes that may be delivered before the next boundary.
    ///
    /// If the remaining header bytes are already buffered, the limit extends
    /// over the whole payload so a complete record goes out in one read.
    fn read_limit(&self, available: &[u8]) -> usize {
        match *self {
            RecordBoundary::Payload { remaining } => remaining,
            RecordBoundary::Header { header, seen } => {
                let need = TLS_RECORD_HEADER_SIZE - seen;
                if available.len() < need {
                    return need;
                }
                let mut complete = header;
                complete[seen..].copy_from_slice(&available[..need]);
                need + u16::from_be_bytes([complete[3], complete[4]]) as usize
            }
        }
    }

    /// Advance over bytes that were handed to the engine.
    fn advance(&mut self, mut delivered: &[u8]) {
        while !delivered.is_empty() {
            match self {
                RecordBoundary::Header { header, seen } => {
                    let take = (TLS_RECORD_HEADER_SIZE - *seen).min(delivered.len());
                    header[*seen..*seen + take].copy_from_slice(&delivered[..take]);
                    *seen += take;
                    delivered = &delivered[take..];
                    if *seen == TLS_RECORD_HEADER_SIZE {
                        let payload_len = u16::from_be_bytes([header[3], header[4]]) as usize;
                        *self = if payload_len == 0 {
                            RecordBoundary::start()
                        } else {
                            RecordBoundary::Payload {
                                remaining: payload_len,
                            }
                        };
                    }
                }
                RecordBoundary::Payload { remaining } => {
                    let take = (*remaining).min(delivered.len());
                    *remaining -= take;
                    delivered = &delivered[take..];
                    if *remaining == 0 {
                        *self = RecordBoundary::start();
                    }
                }
            }
        }
    }
}

/// Bidirectional in-memory byte queue between the network and the TLS engine.
pub struct NetworkBio {
    /// Bytes received from the network, not yet consumed by the engine.
    inbound: BytesMut,
    /// Ciphertext produced by the engine, not yet sent to the network.
    outbound: BytesMut,
    /// Set when the previous outbound batch was handed out; the region is
    /// reset at the start of the next write cycle.
    outbound_taken: bool,
    boundary: RecordBoundary,
    read_would_block: bool,
}

impl NetworkBio {
    pub fn new() -> Self {
        Self {
            inbound: BytesMut::new(),
            outbound: BytesMut::with_capacity(OUTBOUND_INITIAL_CAPACITY),
            outbound_taken: false,
            boundary: RecordBoundary::start(),
            read_would_block: false,
        }
    }

    /// Append bytes received from the network. Multiple calls coalesce.
    pub fn receive_from_network(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Number of inbound bytes the engine has not consumed yet.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Engine-side read: returns up to `buf.len()` buffered inbound bytes,
    /// clamped to the current record, or `WouldBlock` when nothing is buffered.
    pub fn engine_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            self.read_would_block = true;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let limit = self.boundary.read_limit(&self.inbound);
        let n = buf.len().min(self.inbound.len()).min(limit);
        let chunk = self.inbound.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        self.boundary.advance(&chunk);
        Ok(n)
    }

    /// Engine-side write: appends ciphertext to the outbound region.
    ///
    /// The outbound side is always writable, so this accepts everything.
    pub fn engine_write(&mut self, data: &[u8]) -> usize {
        if self.outbound_taken {
            // The previous batch was fully handed out; `split()` already left
            // the region empty, reserving here reclaims the old allocation
            // once the transport has dropped that batch.
            self.outbound.clear();
            self.outbound.reserve(data.len().max(OUTBOUND_INITIAL_CAPACITY));
            self.outbound_taken = false;
        }
        self.outbound.extend_from_slice(data);
        data.len()
    }

    /// Returns all pending ciphertext, or `None` if there is nothing to send.
    pub fn take_outbound_ciphertext(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        self.outbound_taken = true;
        Some(self.outbound.split().freeze())
    }

    /// Returns inbound bytes the engine never consumed, if any.
    ///
    /// Used when TLS is removed from the connection: those bytes belong to
    /// whatever protocol follows.
    pub fn evacuate_unconsumed_inbound(&mut self) -> Option<Bytes> {
        self.boundary = RecordBoundary::start();
        if self.inbound.is_empty() {
            return None;
        }
        Some(self.inbound.split().freeze())
    }

    pub fn clear_retry_flags(&mut self) {
        self.read_would_block = false;
    }

    /// Whether the engine asked for more inbound data since the flags were cleared.
    pub fn should_retry_read(&self) -> bool {
        self.read_would_block
    }

    pub fn reader(&mut self) -> BioReader<'_> {
        BioReader { bio: self }
    }

    pub fn writer(&mut self) -> BioWriter<'_> {
        BioWriter { bio: self }
    }
}

impl Default for NetworkBio {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half handed to the engine's `read_tls()`.
pub struct BioReader<'a> {
    bio: &'a mut NetworkBio,
}

impl Read for BioReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bio.engine_read(buf)
    }
}

/// Write half handed to the engine's `write_tls()`.
pub struct BioWriter<'a> {
    bio: &'a mut NetworkBio,
}

impl Write for BioWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.bio.engine_write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type, 0x03, 0x03];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_read_empty_would_block() {
        let mut bio = NetworkBio::new();
        let mut buf = [0u8; 16];
        let err = bio.engine_read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(bio.should_retry_read());

        bio.clear_retry_flags();
        assert!(!bio.should_retry_read());
    }

    #[test]
    fn test_receive_coalesces() {
        let mut bio = NetworkBio::new();
        let rec = record(23, b"hello world");
        bio.receive_from_network(&rec[..4]);
        bio.receive_from_network(&rec[4..]);
        assert_eq!(bio.inbound_len(), rec.len());

        let mut buf = [0u8; 64];
        let n = bio.engine_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &rec[..]);
    }

    #[test]
    fn test_reads_stop_at_record_boundary() {
        let mut bio = NetworkBio::new();
        let first = record(21, &[1, 0]);
        let second = record(23, b"trailing");
        bio.receive_from_network(&first);
        bio.receive_from_network(&second);

        let mut buf = [0u8; 64];
        let n = bio.engine_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &first[..]);

        let n = bio.engine_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &second[..]);
    }

    #[test]
    fn test_partial_header_then_payload() {
        let mut bio = NetworkBio::new();
        let rec = record(22, &[7u8; 10]);
        bio.receive_from_network(&rec[..3]);

        let mut buf = [0u8; 64];
        assert_eq!(bio.engine_read(&mut buf).unwrap(), 3);

        bio.receive_from_network(&rec[3..]);
        let n = bio.engine_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &rec[3..]);
    }

    #[test]
    fn test_small_reader_buffer() {
        let mut bio = NetworkBio::new();
        let rec = record(23, b"abcdef");
        let next = record(23, b"xyz");
        bio.receive_from_network(&rec);
        bio.receive_from_network(&next);

        let mut buf = [0u8; 4];
        let mut collected = Vec::new();
        while collected.len() < rec.len() {
            let n = bio.engine_read(&mut buf).unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, rec);
        assert_eq!(bio.inbound_len(), next.len());
    }

    #[test]
    fn test_take_outbound_none_when_empty() {
        let mut bio = NetworkBio::new();
        assert!(bio.take_outbound_ciphertext().is_none());
    }

    #[test]
    fn test_outbound_writes_coalesce() {
        let mut bio = NetworkBio::new();
        bio.writer().write_all(b"abc").unwrap();
        bio.writer().write_all(b"def").unwrap();
        assert_eq!(bio.take_outbound_ciphertext().unwrap(), Bytes::from_static(b"abcdef"));
        assert!(bio.take_outbound_ciphertext().is_none());

        bio.writer().write_all(b"ghi").unwrap();
        assert_eq!(bio.take_outbound_ciphertext().unwrap(), Bytes::from_static(b"ghi"));
    }

    #[test]
    fn test_evacuate_unconsumed() {
        let mut bio = NetworkBio::new();
        let close = record(21, &[1, 0]);
        bio.receive_from_network(&close);
        bio.receive_from_network(b"GET / HTTP/1.1\r\n");

        let mut buf = [0u8; 64];
        let n = bio.engine_read(&mut buf).unwrap();
        assert_eq!(n, close.len());

        assert_eq!(
            bio.evacuate_unconsumed_inbound().unwrap(),
            Bytes::from_static(b"GET / HTTP/1.1\r\n")
        );
        assert!(bio.evacuate_unconsumed_inbound().is_none());
    }

    #[test]
    fn test_reader_adapter_reports_would_block() {
        let mut bio = NetworkBio::new();
        let mut buf = [0u8; 8];
        let err = bio.reader().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
