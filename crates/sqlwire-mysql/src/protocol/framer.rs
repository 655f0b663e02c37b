//! Packet framing over a byte stream.
//!
//! # Format
//!
//! Every physical packet is a 4-byte header (3-byte little-endian payload
//! length, 1-byte sequence id) followed by the payload. A logical payload of
//! `max` bytes or more is split into `max`-sized chunks and ends with a
//! shorter chunk, which is empty when the length is an exact multiple of
//! `max`. Sequence ids start at 0 for each command and increase by one per
//! physical packet in both directions, wrapping at 256.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use sqlwire_core::error::{ConnectionErrorKind, ProtocolErrorKind};
use sqlwire_core::{Error, Result};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, connection_error, protocol_error};

/// A bidirectional byte stream the engine can run over.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Split `payload` into framed physical packets starting at `sequence_id`.
///
/// Returns the wire bytes and the sequence id expected next.
pub fn split_into_packets(payload: &[u8], mut sequence_id: u8, max: usize) -> (Vec<u8>, u8) {
    let packets = payload.len() / max + 1;
    let mut out = Vec::with_capacity(payload.len() + packets * PacketHeader::SIZE);
    let mut chunks = payload.chunks(max);
    for _ in 0..packets {
        let chunk = chunks.next().unwrap_or(&[]);
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
    }
    (out, sequence_id)
}

/// Reads and writes logical payloads, enforcing sequence continuity.
pub struct PacketFramer {
    stream: Box<dyn Transport>,
    sequence_id: u8,
    max_packet_size: usize,
    read_buf: Vec<u8>,
}

impl std::fmt::Debug for PacketFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFramer")
            .field("sequence_id", &self.sequence_id)
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

impl PacketFramer {
    /// Wrap a stream using the protocol's maximum packet size.
    pub fn new(stream: Box<dyn Transport>) -> Self {
        Self::with_max_packet_size(stream, MAX_PACKET_SIZE)
    }

    /// Wrap a stream with a custom split threshold (clamped to `1..=MAX_PACKET_SIZE`).
    ///
    /// Both peers must agree on the threshold; anything below the protocol
    /// maximum only makes sense against a test peer.
    pub fn with_max_packet_size(stream: Box<dyn Transport>, max_packet_size: usize) -> Self {
        Self {
            stream,
            sequence_id: 0,
            max_packet_size: max_packet_size.clamp(1, MAX_PACKET_SIZE),
            read_buf: Vec::with_capacity(1024),
        }
    }

    /// Sequence id expected on the next packet in either direction.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Payload size at which a packet is split (and continued on read).
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Read one logical payload into the internal buffer and borrow it.
    ///
    /// The slice stays valid until the next read.
    pub fn read_payload(&mut self) -> Result<&[u8]> {
        self.read_buf.clear();
        loop {
            let mut header_bytes = [0u8; PacketHeader::SIZE];
            read_exact(&mut self.stream, &mut header_bytes)?;
            let header = PacketHeader::from_bytes(&header_bytes);

            if header.sequence_id != self.sequence_id {
                tracing::warn!(
                    expected = self.sequence_id,
                    actual = header.sequence_id,
                    "packet sequence mismatch"
                );
                return Err(protocol_error(
                    ProtocolErrorKind::Desync,
                    format!(
                        "packet sequence mismatch: expected {}, got {}",
                        self.sequence_id, header.sequence_id
                    ),
                ));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = self.read_buf.len();
            self.read_buf.resize(start + len, 0);
            read_exact(&mut self.stream, &mut self.read_buf[start..])?;
            tracing::trace!(
                sequence_id = header.sequence_id,
                length = len,
                "read packet"
            );

            if len < self.max_packet_size {
                break;
            }
        }
        Ok(&self.read_buf)
    }

    /// The payload returned by the last successful [`read_payload`](Self::read_payload).
    pub(crate) fn last_payload(&self) -> &[u8] {
        &self.read_buf
    }

    /// Read one logical payload into an owned buffer.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        self.read_payload().map(<[u8]>::to_vec)
    }

    /// Frame and send one logical payload, then flush.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let (bytes, next) = split_into_packets(payload, self.sequence_id, self.max_packet_size);
        tracing::trace!(
            sequence_id = self.sequence_id,
            length = payload.len(),
            "write packet"
        );
        self.sequence_id = next;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Swap the underlying stream, e.g. to wrap it in TLS.
    #[allow(clippy::result_large_err)]
    pub(crate) fn upgrade_stream<F>(&mut self, wrap: F) -> Result<()>
    where
        F: FnOnce(Box<dyn Transport>) -> Result<Box<dyn Transport>>,
    {
        let placeholder: Box<dyn Transport> = Box::new(io::Cursor::new(Vec::new()));
        let inner = std::mem::replace(&mut self.stream, placeholder);
        self.stream = wrap(inner)?;
        Ok(())
    }

    /// Drop the underlying stream; later reads fail as disconnected.
    pub(crate) fn release(&mut self) {
        self.stream = Box::new(io::Cursor::new(Vec::new()));
    }
}

fn read_exact(stream: &mut Box<dyn Transport>, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            connection_error(
                ConnectionErrorKind::Disconnected,
                "server closed the connection mid-packet",
            )
        } else {
            Error::Io(e)
        }
    })
}
