//! Scripted in-memory MySQL server for end-to-end tests.
//!
//! The server side is a queue of pre-encoded packets; the client's writes are
//! recorded so tests can inspect exactly what went over the wire.

#![allow(dead_code)]

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use sqlwire_mysql::auth;
use sqlwire_mysql::protocol::{PacketWriter, capabilities, split_into_packets, MAX_PACKET_SIZE};
use sqlwire_mysql::{FieldType, MySqlConfig, MySqlConnection};

pub const SCRAMBLE: [u8; 20] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x08, 0x19, 0x2a, 0x3b, 0x4c, 0x5d, 0x6e, 0x7f,
    0x01, 0x12, 0x23, 0x34, 0x45,
];

pub const CONNECTION_ID: u32 = 7;
pub const SERVER_VERSION: &str = "8.0.36";

/// Client writes shared with the test.
pub type Written = Arc<Mutex<Vec<u8>>>;

pub struct MockStream {
    input: Cursor<Vec<u8>>,
    written: Written,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Server packets, queued in the order the client will read them.
pub struct Script {
    bytes: Vec<u8>,
    seq: u8,
    deprecate_eof: bool,
    max_packet_size: usize,
}

impl Script {
    /// Greeting for `mysql_native_password` followed by an OK to the login.
    pub fn new(deprecate_eof: bool) -> Self {
        let mut script = Self::empty(deprecate_eof);
        let greeting = greeting(auth::plugins::MYSQL_NATIVE_PASSWORD, server_caps(deprecate_eof));
        script.packet(&greeting);
        script.seq = 2;
        script.packet(&ok(0, 0, 0x0002));
        script
    }

    /// Nothing queued, not even the greeting.
    pub fn empty(deprecate_eof: bool) -> Self {
        Self {
            bytes: Vec::new(),
            seq: 0,
            deprecate_eof,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Split later packets at `max` bytes, matching a client configured
    /// with the same `max_packet_size`.
    pub fn split_at(&mut self, max: usize) -> &mut Self {
        self.max_packet_size = max;
        self
    }

    /// Queue one packet with the next sequence id.
    pub fn packet(&mut self, payload: &[u8]) -> &mut Self {
        let (bytes, next) = split_into_packets(payload, self.seq, self.max_packet_size);
        self.bytes.extend(bytes);
        self.seq = next;
        self
    }

    /// Queue raw bytes as is.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Set the sequence id of the next packet.
    pub fn seq(&mut self, seq: u8) -> &mut Self {
        self.seq = seq;
        self
    }

    /// Start the response to a new command (sequence 1).
    pub fn reply(&mut self) -> &mut Self {
        self.seq = 1;
        self
    }

    /// Column count, definitions and (without DEPRECATE_EOF) the EOF.
    pub fn columns(&mut self, columns: &[(&str, FieldType, u16, u16)]) -> &mut Self {
        let mut count = PacketWriter::new();
        count.write_lenenc_int(columns.len() as u64);
        self.packet(count.as_bytes());
        self.column_defs(columns)
    }

    /// Definitions only, plus the EOF when required.
    pub fn column_defs(&mut self, columns: &[(&str, FieldType, u16, u16)]) -> &mut Self {
        for &(name, ty, flags, charset) in columns {
            self.packet(&column_def(name, ty, flags, charset));
        }
        if !columns.is_empty() && !self.deprecate_eof {
            self.packet(&eof(0x0002));
        }
        self
    }

    pub fn text_row(&mut self, values: &[Option<&str>]) -> &mut Self {
        let mut w = PacketWriter::new();
        for value in values {
            match value {
                Some(v) => w.write_lenenc_string(v),
                None => w.write_u8(0xFB),
            }
        }
        self.packet(w.as_bytes())
    }

    /// End of rows: OK-with-0xFE or classic EOF.
    pub fn done(&mut self) -> &mut Self {
        if self.deprecate_eof {
            let mut w = PacketWriter::new();
            w.write_u8(0xFE);
            w.write_lenenc_int(0);
            w.write_lenenc_int(0);
            w.write_u16_le(0x0002);
            w.write_u16_le(0);
            self.packet(w.as_bytes())
        } else {
            self.packet(&eof(0x0002))
        }
    }

    pub fn into_stream(self) -> (MockStream, Written) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = MockStream {
            input: Cursor::new(self.bytes),
            written: Arc::clone(&written),
        };
        (stream, written)
    }
}

pub fn server_caps(deprecate_eof: bool) -> u32 {
    let caps = capabilities::DEFAULT_CLIENT_FLAGS
        | capabilities::CLIENT_CONNECT_WITH_DB
        | capabilities::CLIENT_CONNECT_ATTRS
        | capabilities::CLIENT_SSL;
    if deprecate_eof {
        caps
    } else {
        caps & !capabilities::CLIENT_DEPRECATE_EOF
    }
}

pub fn greeting(plugin: &str, caps: u32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(SERVER_VERSION);
    w.write_u32_le(CONNECTION_ID);
    w.write_bytes(&SCRAMBLE[..8]);
    w.write_u8(0);
    w.write_u16_le(caps as u16);
    w.write_u8(255);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SCRAMBLE[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub fn ok(affected_rows: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn err(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sql_state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub fn eof(status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(0);
    w.write_u16_le(status);
    w.into_bytes()
}

pub fn column_def(name: &str, ty: FieldType, flags: u16, charset: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("app");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0C);
    w.write_u16_le(charset);
    w.write_u32_le(255);
    w.write_u8(ty as u8);
    w.write_u16_le(flags);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub fn prepare_ok(statement_id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_u32_le(statement_id);
    w.write_u16_le(columns);
    w.write_u16_le(params);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn config() -> MySqlConfig {
    MySqlConfig::new().user("app").password("secret").database("app")
}

/// Connect over the script, then forget the login bytes.
pub fn connect(script: Script) -> (MySqlConnection, Written) {
    connect_with(script, config())
}

pub fn connect_with(script: Script, config: MySqlConfig) -> (MySqlConnection, Written) {
    let (stream, written) = script.into_stream();
    let conn = MySqlConnection::connect_with_stream(stream, config).expect("handshake");
    written.lock().unwrap().clear();
    (conn, written)
}

/// Split recorded client bytes into `(sequence id, payload)` packets.
pub fn client_packets(written: &Written) -> Vec<(u8, Vec<u8>)> {
    let bytes = written.lock().unwrap().clone();
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let len = usize::from(bytes[pos])
            | usize::from(bytes[pos + 1]) << 8
            | usize::from(bytes[pos + 2]) << 16;
        let seq = bytes[pos + 3];
        packets.push((seq, bytes[pos + 4..pos + 4 + len].to_vec()));
        pos += 4 + len;
    }
    packets
}

/// Scramble the test password against the greeting's scramble.
pub fn native_scramble() -> Vec<u8> {
    auth::scramble_native_password("secret", &SCRAMBLE)
}
