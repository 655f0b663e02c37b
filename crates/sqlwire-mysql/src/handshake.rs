//! Connection phase: greeting, capability negotiation, TLS and authentication.
//!
//! # Flow
//!
//! 1. Server greeting (HandshakeV10, sequence 0).
//! 2. Optional SSL request and TLS upgrade.
//! 3. Handshake response with the first auth response.
//! 4. Zero or more exchange rounds: auth switch (0xFE) or additional auth
//!    data (0x01), ending in OK or ERR.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::{Error, Result};

use crate::auth::{self, AuthPlugin, caching_sha2};
use crate::config::MySqlConfig;
use crate::protocol::{
    ErrPacket, PacketFramer, PacketReader, PacketWriter, capabilities, connection_error,
    malformed, malformed_with, unexpected_packet,
};
use crate::tls;

/// Exchange rounds allowed after the handshake response.
pub const MAX_AUTH_ROUNDS: u8 = 8;

/// Only protocol version spoken.
pub const PROTOCOL_VERSION: u8 = 10;

/// Where the connection phase stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingGreeting,
    CapabilitiesNegotiated,
    /// Handshake response sent; `round` exchange packets read so far
    AuthExchange { round: u8 },
    Authenticated,
    Failed,
}

/// The server greeting (Protocol::HandshakeV10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// 20-byte scramble, parts 1 and 2 joined, trailing NUL removed
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl Greeting {
    /// Parse a greeting payload.
    ///
    /// # Format
    ///
    /// - protocol version (u8, 10)
    /// - server version (NUL-terminated)
    /// - connection id (u32)
    /// - scramble part 1 (8 bytes), filler
    /// - capabilities, low half (u16)
    /// - charset (u8), status (u16), capabilities, high half (u16)
    /// - scramble length (u8), 10 reserved bytes
    /// - scramble part 2 (`max(13, len - 8)` bytes)
    /// - plugin name (NUL-terminated) with `CLIENT_PLUGIN_AUTH`
    ///
    /// An ERR payload (server refusing the connection) becomes a connection
    /// error carrying the server's code.
    #[allow(clippy::result_large_err)]
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(payload)
                .parse_err_packet()
                .ok_or_else(|| malformed_with("truncated ERR greeting", payload))?;
            return Err(refused(err));
        }

        let mut reader = PacketReader::new(payload);
        let truncated = || malformed_with("truncated server greeting", payload);

        let protocol_version = reader.read_u8().ok_or_else(truncated)?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(malformed(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }
        let server_version = reader.read_null_string().ok_or_else(truncated)?;
        let connection_id = reader.read_u32_le().ok_or_else(truncated)?;
        let mut scramble = reader.read_bytes(8).ok_or_else(truncated)?.to_vec();
        reader.read_u8().ok_or_else(truncated)?;
        let caps_low = reader.read_u16_le().ok_or_else(truncated)?;
        let charset = reader.read_u8().ok_or_else(truncated)?;
        let status_flags = reader.read_u16_le().ok_or_else(truncated)?;
        let caps_high = reader.read_u16_le().ok_or_else(truncated)?;
        let capabilities = u32::from(caps_low) | (u32::from(caps_high) << 16);

        let scramble_len = reader.read_u8().ok_or_else(truncated)?;
        if !reader.skip(10) {
            return Err(truncated());
        }

        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = usize::from(scramble_len).saturating_sub(8).max(13);
            let part2 = reader.read_bytes(part2_len).ok_or_else(truncated)?;
            scramble.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            // some servers omit the final NUL
            let rest = reader.read_rest();
            let name = rest.strip_suffix(&[0]).unwrap_or(rest);
            String::from_utf8_lossy(name).into_owned()
        } else {
            auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Result of a completed connection phase.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: u32,
    pub server_version: String,
    /// Negotiated capabilities, frozen for the session
    pub capabilities: u32,
    pub status_flags: u16,
    pub tls: bool,
}

/// Build the handshake response payload (Protocol::HandshakeResponse41).
pub fn build_handshake_response(
    config: &MySqlConfig,
    client_caps: u32,
    auth_response: &[u8],
    plugin: &str,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(128);
    writer.write_u32_le(client_caps);
    writer.write_u32_le(config.max_allowed_packet);
    writer.write_u8(config.charset);
    writer.write_zeros(23);
    writer.write_null_string(&config.user);

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(auth_response);
    } else if client_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(auth_response);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }

    if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(config.database.as_deref().unwrap_or(""));
    }
    if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(plugin);
    }
    if client_caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        let mut attrs = PacketWriter::new();
        for (key, value) in &config.attributes {
            attrs.write_lenenc_string(key);
            attrs.write_lenenc_string(value);
        }
        writer.write_lenenc_bytes(attrs.as_bytes());
    }
    writer.into_bytes()
}

/// Drives the connection phase over a fresh framer.
pub struct Handshake<'a> {
    config: &'a MySqlConfig,
    state: HandshakeState,
    plugin: AuthPlugin,
    scramble: Vec<u8>,
    secure: bool,
    /// caching_sha2 full auth asked the server for its key
    awaiting_public_key: bool,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a MySqlConfig) -> Self {
        Self {
            config,
            state: HandshakeState::AwaitingGreeting,
            plugin: AuthPlugin::NativePassword,
            scramble: Vec::new(),
            secure: false,
            awaiting_public_key: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the whole connection phase. On error the state is `Failed`.
    #[allow(clippy::result_large_err)]
    pub fn run(&mut self, framer: &mut PacketFramer) -> Result<SessionInfo> {
        let result = self.run_inner(framer);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    #[allow(clippy::result_large_err)]
    fn run_inner(&mut self, framer: &mut PacketFramer) -> Result<SessionInfo> {
        framer.reset_sequence();
        let greeting = Greeting::parse(framer.read_payload()?)?;
        tracing::debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = %greeting.auth_plugin,
            "received server greeting"
        );

        if greeting.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(connection_error(
                ConnectionErrorKind::Connect,
                "server does not support protocol 4.1",
            ));
        }

        let use_tls = tls::validate_ssl_mode(self.config.ssl_mode, greeting.capabilities)?;
        let mut caps = self.config.capability_flags() & greeting.capabilities;
        if !use_tls {
            caps &= !capabilities::CLIENT_SSL;
        }
        self.state = HandshakeState::CapabilitiesNegotiated;

        self.plugin = AuthPlugin::from_name(&greeting.auth_plugin).ok_or_else(|| {
            unsupported_plugin(&greeting.auth_plugin)
        })?;
        self.scramble = greeting.scramble.clone();

        if use_tls {
            framer.write_packet(&tls::build_ssl_request_packet(
                caps,
                self.config.max_allowed_packet,
                self.config.charset,
            ))?;
            let config = self.config;
            framer.upgrade_stream(|stream| {
                tls::upgrade(stream, &config.tls_config, &config.host, config.ssl_mode)
            })?;
            self.secure = true;
            tracing::debug!("connection upgraded to TLS");
        }

        let first = self.plugin.initial_response(
            self.password(),
            &self.scramble,
            self.secure,
            self.config.allow_cleartext_password,
        )?;
        framer.write_packet(&build_handshake_response(
            self.config,
            caps,
            &first,
            self.plugin.name(),
        ))?;

        let status_flags = self.exchange(framer, caps)?;
        self.state = HandshakeState::Authenticated;
        tracing::debug!(plugin = self.plugin.name(), "authenticated");

        Ok(SessionInfo {
            connection_id: greeting.connection_id,
            server_version: greeting.server_version,
            capabilities: caps,
            status_flags,
            tls: self.secure,
        })
    }

    fn password(&self) -> &'a str {
        self.config.password.as_deref().unwrap_or("")
    }

    /// Read exchange packets until OK (returns its status flags) or ERR.
    #[allow(clippy::result_large_err)]
    fn exchange(&mut self, framer: &mut PacketFramer, caps: u32) -> Result<u16> {
        let mut round = 0u8;
        loop {
            if round == MAX_AUTH_ROUNDS {
                return Err(malformed(format!(
                    "authentication did not finish within {} rounds",
                    MAX_AUTH_ROUNDS
                )));
            }
            round += 1;
            self.state = HandshakeState::AuthExchange { round };

            let payload = framer.read_packet()?;
            match payload.first() {
                Some(0x00) => {
                    let session_track = caps & capabilities::CLIENT_SESSION_TRACK != 0;
                    let ok = PacketReader::new(&payload)
                        .parse_ok_packet(session_track)
                        .ok_or_else(|| malformed_with("truncated OK packet", &payload))?;
                    return Ok(ok.status_flags);
                }
                Some(0xFF) => {
                    let err = PacketReader::new(&payload)
                        .parse_err_packet()
                        .ok_or_else(|| malformed_with("truncated ERR packet", &payload))?;
                    return Err(auth_failed(err));
                }
                Some(0xFE) => {
                    let response = self.switch_plugin(&payload[1..])?;
                    framer.write_packet(&response)?;
                }
                Some(0x01) => {
                    if let Some(response) = self.more_data(&payload[1..])? {
                        framer.write_packet(&response)?;
                    }
                }
                _ => {
                    return Err(unexpected_packet(format!(
                        "unexpected packet 0x{:02X} during authentication",
                        payload.first().copied().unwrap_or(0)
                    )));
                }
            }
        }
    }

    /// Auth switch request: plugin name, then the new scramble.
    #[allow(clippy::result_large_err)]
    fn switch_plugin(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut reader = PacketReader::new(body);
        let name = reader
            .read_null_string()
            .ok_or_else(|| malformed_with("truncated auth switch request", body))?;
        let plugin = AuthPlugin::from_name(&name).ok_or_else(|| unsupported_plugin(&name))?;
        let data = reader.read_rest();

        tracing::debug!(from = self.plugin.name(), to = plugin.name(), "auth switch");
        self.plugin = plugin;
        self.scramble = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
        self.awaiting_public_key = false;
        plugin.initial_response(
            self.password(),
            &self.scramble,
            self.secure,
            self.config.allow_cleartext_password,
        )
    }

    /// Additional auth data (0x01 header). Returns the reply to send, if any.
    #[allow(clippy::result_large_err)]
    fn more_data(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        match (self.plugin, data) {
            (AuthPlugin::CachingSha2Password, [caching_sha2::FAST_AUTH_SUCCESS]) => {
                tracing::debug!("caching_sha2 fast auth succeeded");
                Ok(None)
            }
            (AuthPlugin::CachingSha2Password, [caching_sha2::PERFORM_FULL_AUTH]) => {
                tracing::debug!(secure = self.secure, "caching_sha2 full auth");
                if self.secure {
                    return Ok(Some(auth::cleartext_password(self.password())));
                }
                match &self.config.server_public_key {
                    Some(pem) => self.rsa_response(pem).map(Some),
                    None => {
                        self.awaiting_public_key = true;
                        Ok(Some(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                    }
                }
            }
            (AuthPlugin::CachingSha2Password, pem) if self.awaiting_public_key => {
                self.awaiting_public_key = false;
                self.rsa_response(pem).map(Some)
            }
            (AuthPlugin::Sha256Password, pem) => self.rsa_response(pem).map(Some),
            (plugin, _) => Err(unexpected_packet(format!(
                "unexpected auth data for {}",
                plugin.name()
            ))),
        }
    }

    #[allow(clippy::result_large_err)]
    fn rsa_response(&self, pem: &[u8]) -> Result<Vec<u8>> {
        auth::encrypt_password_rsa(self.password(), &self.scramble, pem)
    }
}

fn unsupported_plugin(name: &str) -> Error {
    connection_error(
        ConnectionErrorKind::UnsupportedAuthMethod,
        format!("unsupported authentication plugin '{}'", name),
    )
}

fn auth_failed(err: ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: format!(
            "authentication failed: {} ({})",
            err.error_message, err.error_code
        ),
        server_error: Some(err.server_info()),
        source: None,
    })
}

fn refused(err: ErrPacket) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Refused,
        message: format!(
            "server refused connection: {} ({})",
            err.error_message, err.error_code
        ),
        server_error: Some(err.server_info()),
        source: None,
    })
}
