//! Cursor over a packet payload.
//!
//! Every read returns `None` when the payload is too short; callers turn
//! that into a malformed-packet error with the context they have.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// Lenenc first byte announcing SQL NULL in a text row.
pub const LENENC_NULL: u8 = 0xFB;

#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.take::<3>()?;
        Some(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    /// Length-encoded integer: values up to 0xFA inline, otherwise a 0xFC,
    /// 0xFD or 0xFE prefix before 2, 3 or 8 bytes. 0xFB (NULL) and 0xFF
    /// yield `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded byte slice without copying.
    pub fn read_lenenc_slice(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a text-row cell: a lenenc byte string or the NULL marker.
    ///
    /// The outer `None` means the payload is truncated; `Some(None)` is SQL NULL.
    pub fn read_nullable_lenenc_slice(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek()? == LENENC_NULL {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_slice().map(Some)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_slice()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// NUL-terminated string. A missing terminator consumes the rest of the payload.
    pub fn read_null_string(&mut self) -> Option<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let (bytes, consumed) = match rest.iter().position(|&b| b == 0) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Advance `n` bytes; `false` (and no move) if fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet (header 0x00, or 0xFE when it terminates rows).
    ///
    /// # Format
    ///
    /// - header byte
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - info: lenenc string when `session_track`, else rest of packet;
    ///   session state changes after it are skipped
    pub fn parse_ok_packet(&mut self, session_track: bool) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = if self.is_empty() {
            String::new()
        } else if session_track {
            let info = self.read_lenenc_string().unwrap_or_default();
            self.read_rest();
            info
        } else {
            self.read_rest_string()
        };

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet.
    ///
    /// # Format
    ///
    /// - 0xFF header
    /// - error_code: 2 bytes
    /// - '#' marker and 5-byte sql_state (protocol 4.1)
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet.
    ///
    /// # Format
    ///
    /// - 0xFE header
    /// - warnings: 2 bytes
    /// - status_flags: 2 bytes
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_reads() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0xFA]);
        assert_eq!(reader.read_lenenc_int(), Some(250));

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x1234));

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0012_3456));

        let mut reader = PacketReader::new(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0807_0605_0403_0201));

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int(), None);

        let mut reader = PacketReader::new(&[0xFC, 0x34]);
        assert_eq!(reader.read_lenenc_int(), None);
    }

    #[test]
    fn test_nullable_cells() {
        let mut reader = PacketReader::new(&[0x01, b'1', 0xFB, 0x00, 0x03, b'a']);
        assert_eq!(reader.read_nullable_lenenc_slice(), Some(Some(&b"1"[..])));
        assert_eq!(reader.read_nullable_lenenc_slice(), Some(None));
        assert_eq!(reader.read_nullable_lenenc_slice(), Some(Some(&b""[..])));
        // declared length 3, only 1 byte present
        assert_eq!(reader.read_nullable_lenenc_slice(), None);
    }

    #[test]
    fn test_read_null_string() {
        let mut reader = PacketReader::new(b"8.0.36\0tail");
        assert_eq!(reader.read_null_string(), Some("8.0.36".to_string()));
        assert_eq!(reader.read_null_string(), Some("tail".to_string()));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet(false).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_with_info() {
        let mut data = vec![0x00, 0x03, 0x00, 0x02, 0x00, 0x01, 0x00];
        data.extend_from_slice(b"Rows matched: 3");
        let ok = PacketReader::new(&data).parse_ok_packet(false).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "Rows matched: 3");
    }

    #[test]
    fn test_parse_ok_packet_session_track() {
        let data = [0x00, 0x00, 0x00, 0x02, 0x40, 0x00, 0x00, 0x02, b'o', b'k', 0x05, 0x01];
        let ok = PacketReader::new(&data).parse_ok_packet(true).unwrap();
        assert_eq!(ok.info, "ok");
        assert_eq!(ok.status_flags, 0x4002);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x01, 0x00, 0x22, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 1);
        assert_eq!(eof.status_flags, 0x22);
    }
}
