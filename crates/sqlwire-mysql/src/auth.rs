//! Authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (password cached on the server):
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
//! ```
//!
//! Full auth sends the password in clear over TLS, or RSA-encrypted
//! (`password\0 XOR scramble`) with the server's public key otherwise.
//!
//! # sha256_password
//!
//! Always full auth: clear over TLS, RSA otherwise.
//!
//! # mysql_clear_password
//!
//! The NUL-terminated password as is.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use sqlwire_core::Result;
use sqlwire_core::error::ConnectionErrorKind;

use crate::protocol::connection_error;

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Client request for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Client request for the RSA public key under sha256_password.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// A supported authentication plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
}

impl AuthPlugin {
    /// Look up a plugin by the name the server announces.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(Self::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Some(Self::CachingSha2Password),
            plugins::SHA256_PASSWORD => Some(Self::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Some(Self::ClearPassword),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            Self::Sha256Password => plugins::SHA256_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }

    /// First auth response for this plugin.
    ///
    /// `secure` is true when the transport is TLS. Clear-text plugins are
    /// refused on an insecure transport unless `allow_cleartext` is set.
    #[allow(clippy::result_large_err)]
    pub fn initial_response(
        self,
        password: &str,
        scramble: &[u8],
        secure: bool,
        allow_cleartext: bool,
    ) -> Result<Vec<u8>> {
        match self {
            Self::NativePassword => Ok(scramble_native_password(password, scramble)),
            Self::CachingSha2Password => Ok(scramble_caching_sha2(password, scramble)),
            Self::Sha256Password if password.is_empty() => Ok(vec![0]),
            Self::Sha256Password if secure => Ok(cleartext_password(password)),
            Self::Sha256Password => Ok(vec![SHA256_REQUEST_PUBLIC_KEY]),
            Self::ClearPassword if secure || allow_cleartext => Ok(cleartext_password(password)),
            Self::ClearPassword => Err(connection_error(
                ConnectionErrorKind::UnsupportedAuthMethod,
                "mysql_clear_password requires TLS or allow_cleartext_password",
            )),
        }
    }
}

fn seed(scramble: &[u8]) -> &[u8] {
    // the greeting's scramble carries a trailing NUL
    match scramble {
        [head @ .., 0] if head.len() == 20 => head,
        _ => scramble,
    }
}

/// `mysql_native_password` scramble; empty for an empty password.
pub fn scramble_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed(scramble));
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();
    xor(&stage1, &stage3)
}

/// `caching_sha2_password` fast-auth scramble; empty for an empty password.
pub fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash2: [u8; 32] = Sha256::digest(hash1).into();
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(seed(scramble));
    let hash3: [u8; 32] = hasher.finalize().into();
    xor(&hash1, &hash3)
}

/// The password followed by a NUL byte.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// `password\0` XOR the scramble, repeated to length.
pub fn xor_password_with_scramble(password: &str, scramble: &[u8]) -> Vec<u8> {
    let mut out = cleartext_password(password);
    let seed = seed(scramble);
    if !seed.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= seed[i % seed.len()];
        }
    }
    out
}

/// Encrypt the password with the server's RSA public key (PEM, PKCS#8 or
/// PKCS#1) using OAEP padding.
#[allow(clippy::result_large_err)]
pub fn encrypt_password_rsa(password: &str, scramble: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let auth_err = |msg: String| connection_error(ConnectionErrorKind::Authentication, msg);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_err(format!("server public key is not PEM: {}", e)))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| auth_err(format!("invalid server public key: {}", e)))?;

    let plain = xor_password_with_scramble(password, scramble);
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_err(format!("RSA encryption failed: {}", e)))
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn scramble() -> Vec<u8> {
        (1..=20).collect()
    }

    #[test]
    fn test_native_password_vector() {
        assert_eq!(
            scramble_native_password("secret", &scramble()),
            hex("b32bb3a583e1340c0a1108d58b1be49781ad8c2f")
        );
        assert!(scramble_native_password("", &scramble()).is_empty());
    }

    #[test]
    fn test_caching_sha2_vector() {
        assert_eq!(
            scramble_caching_sha2("secret", &scramble()),
            hex("746ebe205d56a0707acb3e796e834e0dd7b1d61743b26bd5202c7a623230c7c9")
        );
    }

    #[test]
    fn test_trailing_nul_is_ignored() {
        let mut with_nul = scramble();
        with_nul.push(0);
        assert_eq!(
            scramble_caching_sha2("secret", &with_nul),
            scramble_caching_sha2("secret", &scramble())
        );
        assert_eq!(
            scramble_native_password("secret", &with_nul),
            scramble_native_password("secret", &scramble())
        );
    }

    #[test]
    fn test_xor_password_with_scramble() {
        let seed = [1, 2, 3, 4, 5, 6, 7, 8];
        let out = xor_password_with_scramble("test", &seed);
        assert_eq!(out.len(), 5);
        assert_eq!(out[4], 5);
        let recovered: Vec<u8> = out[..4].iter().zip(seed).map(|(b, s)| b ^ s).collect();
        assert_eq!(recovered, b"test");
    }

    #[test]
    fn test_plugin_lookup() {
        assert_eq!(
            AuthPlugin::from_name("caching_sha2_password"),
            Some(AuthPlugin::CachingSha2Password)
        );
        assert_eq!(AuthPlugin::from_name("auth_gssapi_client"), None);
        assert_eq!(AuthPlugin::Sha256Password.name(), plugins::SHA256_PASSWORD);
    }

    #[test]
    fn test_clear_password_requires_tls_or_opt_in() {
        let err = AuthPlugin::ClearPassword
            .initial_response("pw", &scramble(), false, false)
            .unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::UnsupportedAuthMethod));
        let ok = AuthPlugin::ClearPassword
            .initial_response("pw", &scramble(), true, false)
            .unwrap();
        assert_eq!(ok, b"pw\0");
    }

    #[test]
    fn test_sha256_initial_response() {
        let plugin = AuthPlugin::Sha256Password;
        assert_eq!(plugin.initial_response("pw", &scramble(), false, false).unwrap(), vec![1]);
        assert_eq!(plugin.initial_response("pw", &scramble(), true, false).unwrap(), b"pw\0");
        assert_eq!(plugin.initial_response("", &scramble(), false, false).unwrap(), vec![0]);
    }

    #[test]
    fn test_encrypt_rejects_bad_pem() {
        let err = encrypt_password_rsa("pw", &scramble(), b"not a key").unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Authentication));
    }
}
