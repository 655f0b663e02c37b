//! TLS upgrade of a MySQL connection.
//!
//! # Handshake Flow
//!
//! 1. The greeting advertises `CLIENT_SSL`.
//! 2. The client sends a short SSL request (sequence 1): capabilities with
//!    `CLIENT_SSL`, max packet size, charset, 23 reserved zero bytes.
//! 3. Client and server run the TLS handshake on the raw socket.
//! 4. The handshake response (sequence 2) and the rest of the session travel
//!    inside TLS.
//!
//! The rustls stream is only available with the `tls` feature; without it
//! [`TlsStream::new`] fails with `ConnectionErrorKind::Ssl`.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::Result;
use sqlwire_core::error::ConnectionErrorKind;

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, Transport, capabilities, connection_error};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the SSL request payload.
///
/// # Format
///
/// - capability flags (u32) with `CLIENT_SSL`
/// - max packet size (u32)
/// - character set (u8)
/// - 23 reserved zero bytes
pub fn build_ssl_request_packet(client_caps: u32, max_packet_size: u32, character_set: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
    writer.into_bytes()
}

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
///
/// Fails when the mode requires TLS and either the server does not offer it
/// or the `tls` feature is off. `Preferred` falls back to plaintext in both
/// cases.
#[allow(clippy::result_large_err)]
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool> {
    let offered = server_supports_ssl(server_caps);
    let compiled = cfg!(feature = "tls");
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(offered && compiled),
        _ if !offered => Err(tls_error(format!(
            "ssl mode {:?} requires TLS but the server does not offer it",
            ssl_mode
        ))),
        _ if !compiled => Err(tls_error(format!(
            "ssl mode {:?} requires the `tls` feature of sqlwire-mysql",
            ssl_mode
        ))),
        _ => Ok(true),
    }
}

/// Check the TLS settings are coherent for the mode.
#[allow(clippy::result_large_err)]
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls_config.ca_cert_path.is_none()
        && !tls_config.danger_skip_verify
    {
        return Err(tls_error(
            "verify modes need a CA certificate (ca_cert) or skip_verify",
        ));
    }
    Ok(())
}

/// Wrap `stream` in TLS for `host`, as the framer's new transport.
#[allow(clippy::result_large_err)]
pub(crate) fn upgrade(
    stream: Box<dyn Transport>,
    tls_config: &TlsConfig,
    host: &str,
    ssl_mode: SslMode,
) -> Result<Box<dyn Transport>> {
    let tls = TlsStream::new(stream, tls_config, host, ssl_mode)?;
    Ok(Box::new(tls))
}

fn tls_error(message: impl Into<String>) -> sqlwire_core::Error {
    connection_error(ConnectionErrorKind::Ssl, message)
}

/// A rustls client session over a blocking stream.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    #[allow(clippy::result_large_err)]
    pub fn new(mut stream: S, tls_config: &TlsConfig, host: &str, ssl_mode: SslMode) -> Result<Self> {
        validate_tls_config(ssl_mode, tls_config)?;
        let config = build_client_config(tls_config, ssl_mode)?;

        let sni = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|e| tls_error(format!("invalid server name '{}': {}", sni, e)))?;
        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("TLS setup failed: {}", e)))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| tls_error(format!("TLS handshake failed: {}", e)))?;
        }
        tracing::debug!(
            version = ?conn.protocol_version(),
            "TLS handshake complete"
        );
        Ok(Self { conn, stream })
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => return Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if self.conn.read_tls(&mut self.stream)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| std::io::Error::other(format!("TLS error: {}", e)))?;
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

/// `Preferred` and `Required` encrypt without verifying the server, like the
/// MySQL command-line client; the verify modes check the chain against the
/// configured CA (or the webpki roots).
#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_client_config(tls_config: &TlsConfig, ssl_mode: SslMode) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("unsupported TLS versions: {}", e)))?;

    let verify = matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && !tls_config.danger_skip_verify;

    let builder = if verify {
        let mut roots = rustls::RootCertStore::empty();
        match &tls_config.ca_cert_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(format!("invalid CA certificate: {}", e)))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCert))
    };

    match (&tls_config.client_cert_path, &tls_config.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error(format!("invalid client certificate: {}", e)))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn load_certs(path: &std::path::Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("cannot open '{}': {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("cannot parse '{}': {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates in '{}'", path.display())));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn load_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("cannot open '{}': {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .map_err(|e| tls_error(format!("cannot parse '{}': {}", path.display(), e)))?
        .ok_or_else(|| tls_error(format!("no private key in '{}'", path.display())))
}

#[cfg(feature = "tls")]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts every server certificate.
    #[derive(Debug)]
    pub(super) struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// Stand-in when the `tls` feature is disabled.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    _inner: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    /// Always fails: TLS needs the `tls` feature.
    #[allow(clippy::result_large_err)]
    pub fn new(_stream: S, _tls_config: &TlsConfig, _host: &str, _ssl_mode: SslMode) -> Result<Self> {
        Err(tls_error(
            "TLS support requires the `tls` feature of sqlwire-mysql",
        ))
    }
}

#[cfg(not(feature = "tls"))]
impl<S> std::io::Read for TlsStream<S> {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("TLS support is not compiled in"))
    }
}

#[cfg(not(feature = "tls"))]
impl<S> std::io::Write for TlsStream<S> {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("TLS support is not compiled in"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
