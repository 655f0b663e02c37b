//! MySQL connection configuration.
//!
//! Connection parameters, TLS settings and session behavior knobs, built
//! either with the builder methods or from a `mysql://` URL.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlwire_core::Error;
use sqlwire_core::error::ConfigError;

use crate::protocol::{MAX_PACKET_SIZE, capabilities, charset};

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Use SSL if the server offers it
    Preferred,
    /// Require SSL, no certificate verification
    Required,
    /// Require SSL and verify the server certificate
    VerifyCa,
    /// Require SSL and verify the certificate matches the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" | "preferred" => Ok(SslMode::Preferred),
            "require" | "required" => Ok(SslMode::Required),
            "verify_ca" => Ok(SslMode::VerifyCa),
            "verify_identity" => Ok(SslMode::VerifyIdentity),
            _ => Err(config_error(format!("unknown ssl-mode '{}'", s))),
        }
    }
}

/// Certificates and verification options for the TLS upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA bundle used to verify the server (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS (PEM)
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
    /// SNI / verification name, when it differs from the connect host
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Skip server certificate verification. Only for testing.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Default schema selected at connect time
    pub database: Option<String>,
    /// Collation id sent in the handshake response
    pub charset: u8,
    pub connect_timeout: Duration,
    /// Socket read timeout; expiry is fatal for the connection
    pub read_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls_config: TlsConfig,
    /// Connection attributes sent with `CLIENT_CONNECT_ATTRS`
    pub attributes: BTreeMap<String, String>,
    /// Physical packet split threshold (at most 16MB - 1)
    pub max_packet_size: usize,
    /// max_allowed_packet advertised to the server
    pub max_allowed_packet: u32,
    /// Drain an unfinished result set before the next command instead of
    /// failing with `ResultSetNotDrained`
    pub drain_on_new_command: bool,
    /// Permit clear-text password plugins without TLS
    pub allow_cleartext_password: bool,
    /// Server RSA public key (PEM) for caching_sha2/sha256 full auth
    pub server_public_key: Option<Vec<u8>>,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            read_timeout: None,
            ssl_mode: SslMode::default(),
            tls_config: TlsConfig::default(),
            attributes: BTreeMap::new(),
            max_packet_size: MAX_PACKET_SIZE,
            max_allowed_packet: 64 * 1024 * 1024,
            drain_on_new_command: true,
            allow_cleartext_password: false,
            server_public_key: None,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `mysql://[user[:password]@]host[:port][/database][?options]`.
    ///
    /// Options: `ssl-mode`, `connect-timeout` and `read-timeout` (seconds),
    /// `max-packet-size`, `drain-on-new-command`, `allow-cleartext-password`.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let rest = url
            .strip_prefix("mysql://")
            .ok_or_else(|| config_error(format!("URL must start with mysql://: '{}'", url)))?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let mut config = Self::new();
        if let Some(userinfo) = userinfo {
            match userinfo.split_once(':') {
                Some((user, password)) => {
                    config.user = percent_decode(user)?;
                    config.password = Some(percent_decode(password)?);
                }
                None => config.user = percent_decode(userinfo)?,
            }
        }

        // [v6addr]:port or host:port
        let (host, port) = match hostport.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| config_error(format!("unclosed '[' in '{}'", url)))?;
                (host, after.strip_prefix(':'))
            }
            None => match hostport.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            },
        };
        if !host.is_empty() {
            config.host = host.to_string();
        }
        if let Some(port) = port {
            config.port = port
                .parse()
                .map_err(|_| config_error(format!("invalid port '{}'", port)))?;
        }
        if !path.is_empty() {
            config.database = Some(percent_decode(path)?);
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            config = config.apply_option(key, &percent_decode(value)?)?;
        }
        Ok(config)
    }

    fn apply_option(self, key: &str, value: &str) -> Result<Self, Error> {
        let secs = |v: &str| {
            v.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| config_error(format!("invalid {} '{}'", key, v)))
        };
        let flag = |v: &str| match v {
            "true" | "1" | "" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(config_error(format!("invalid {} '{}'", key, v))),
        };
        Ok(match key.replace('_', "-").as_str() {
            "ssl-mode" | "sslmode" => self.ssl_mode(value.parse()?),
            "connect-timeout" => self.connect_timeout(secs(value)?),
            "read-timeout" => self.read_timeout(secs(value)?),
            "max-packet-size" => self.max_packet_size(
                value
                    .parse()
                    .map_err(|_| config_error(format!("invalid {} '{}'", key, value)))?,
            ),
            "drain-on-new-command" => self.drain_on_new_command(flag(value)?),
            "allow-cleartext-password" => self.allow_cleartext_password(flag(value)?),
            _ => return Err(config_error(format!("unknown URL option '{}'", key))),
        })
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls_config = tls;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the physical packet size at which payloads are split on write and
    /// continued on read.
    ///
    /// Clamped to `1..=16MB-1`.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.clamp(1, MAX_PACKET_SIZE);
        self
    }

    pub fn max_allowed_packet(mut self, size: u32) -> Self {
        self.max_allowed_packet = size;
        self
    }

    pub fn drain_on_new_command(mut self, enabled: bool) -> Self {
        self.drain_on_new_command = enabled;
        self
    }

    pub fn allow_cleartext_password(mut self, allowed: bool) -> Self {
        self.allow_cleartext_password = allowed;
        self
    }

    /// Provide the server's RSA public key instead of requesting it.
    pub fn server_public_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.server_public_key = Some(pem.into());
        self
    }

    /// `host:port` for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Capability flags the client offers, before intersecting with the server's.
    pub fn capability_flags(&self) -> u32 {
        use capabilities::{
            CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_SSL, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }
        if !self.attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }
        flags
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

fn percent_decode(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| config_error(format!("invalid percent escape in '{}'", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| config_error(format!("'{}' is not valid UTF-8", s)))
}
