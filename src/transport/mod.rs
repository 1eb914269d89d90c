//! Secure transport engine.
//!
//! This module provides the [`TlsEngine`], which drives a
//! [`ConnectionContext`](crate::ConnectionContext) through its lifecycle:
//! client connect or server listen, accept, handshake, message exchange and
//! teardown.

pub(crate) mod cipher;
pub(crate) mod diagnostics;
mod tls;
pub(crate) mod tls_config;

pub use cipher::{CipherPolicy, CIPHER_BLACKLIST_ENV, DEFAULT_CIPHER_BLACKLIST};
pub use diagnostics::HandshakeSummary;
pub use tls::TlsEngine;
pub(crate) use tls::{SessionConfig, TlsConnection};
pub use tls_config::{CertMaterial, SERVER_CERT_FILE, SERVER_KEY_FILE, TRUST_STORE_FILE};

use crate::config::{get_namespaced_millis, get_namespaced_optional_string};
use crate::error::Error;
use ::config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const SHUTDOWN_GRACE_TICKS: u32 = 10;

/// Result of one [`TlsEngine::read_incoming`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were received; see
    /// [`ConnectionContext::received`](crate::ConnectionContext::received).
    Data(usize),
    /// The peer closed the stream. The context is now `Inactive`.
    PeerClosed,
    /// Nothing arrived within the read poll timeout.
    Pending,
}

/// Result of one [`TlsEngine::listen_incoming`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// A peer was accepted and the handshake completed.
    Accepted(SocketAddr),
    /// No peer is waiting yet.
    Pending,
}

/// Engine-wide settings.
///
/// # Configuration Keys
///
/// - `handshake_timeout_ms`: Upper bound for a TLS handshake (default 10000)
/// - `connect_timeout_ms`: Upper bound for the outbound TCP connect (default 10000)
/// - `poll_interval_ms`: Worker tick and socket read timeout (default 100)
/// - `shutdown_grace_ms`: How long shutdown waits for workers (default 10 ticks)
/// - `tls_server_name`: Name the server certificate must be valid for
///   (defaults to the configured peer address)
/// - `cert_dir`: Certificate material directory (defaults to `~/.securechat`)
/// - `cipher_blacklist`: Cipher exclusion list (defaults to
///   [`DEFAULT_CIPHER_BLACKLIST`])
///
/// # Example
///
/// ```toml
/// poll_interval_ms = 100
/// tls_server_name = "chat.example.org"
/// cipher_blacklist = "!aNULL:!eNULL:!3DES:!SHA1:!AES128"
/// ```
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub tls_server_name: Option<String>,
    pub cert_dir: Option<PathBuf>,
    pub cipher_policy: CipherPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let poll_interval = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            poll_interval,
            shutdown_grace: poll_interval * SHUTDOWN_GRACE_TICKS,
            tls_server_name: None,
            cert_dir: None,
            cipher_policy: CipherPolicy::default(),
        }
    }
}

impl EngineSettings {
    /// Reads settings from configuration. See [`Self::from_config_named`].
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings with configuration namespacing.
    ///
    /// Lookup order: `{name}.{key}`, then `{key}`, then the built-in default.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let poll_interval_ms =
            get_namespaced_millis(config, name, "poll_interval_ms", DEFAULT_POLL_INTERVAL_MS)?;
        let poll_interval = Duration::from_millis(poll_interval_ms);

        let shutdown_grace_ms = get_namespaced_millis(
            config,
            name,
            "shutdown_grace_ms",
            poll_interval_ms.saturating_mul(SHUTDOWN_GRACE_TICKS as u64),
        )?;

        let cipher_policy = get_namespaced_optional_string(config, name, "cipher_blacklist")?
            .map(|spec| CipherPolicy::parse(&spec))
            .unwrap_or_default();

        let settings = Self {
            handshake_timeout: Duration::from_millis(get_namespaced_millis(
                config,
                name,
                "handshake_timeout_ms",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?),
            connect_timeout: Duration::from_millis(get_namespaced_millis(
                config,
                name,
                "connect_timeout_ms",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?),
            poll_interval,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            tls_server_name: get_namespaced_optional_string(config, name, "tls_server_name")?,
            cert_dir: get_namespaced_optional_string(config, name, "cert_dir")?.map(PathBuf::from),
            cipher_policy,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects zero durations. Socket timeouts cannot be zero and a zero poll
    /// interval would make workers spin.
    pub fn validate(&self) -> Result<(), Error> {
        let durations = [
            ("handshake_timeout_ms", self.handshake_timeout),
            ("connect_timeout_ms", self.connect_timeout),
            ("poll_interval_ms", self.poll_interval),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidSetting {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_keys() {
        let settings = EngineSettings::from_config(&Config::default()).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.shutdown_grace, Duration::from_millis(1000));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.tls_server_name, None);
        assert_eq!(settings.cipher_policy, CipherPolicy::default());
    }

    #[test]
    fn keys_override_defaults() {
        let config = Config::builder()
            .set_default("poll_interval_ms", 20)
            .unwrap()
            .set_default("tls_server_name", "localhost")
            .unwrap()
            .set_default("cert_dir", "/tmp/certs")
            .unwrap()
            .set_default("cipher_blacklist", "!CHACHA20")
            .unwrap()
            .build()
            .unwrap();
        let settings = EngineSettings::from_config(&config).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(20));
        assert_eq!(settings.shutdown_grace, Duration::from_millis(200));
        assert_eq!(settings.tls_server_name.as_deref(), Some("localhost"));
        assert_eq!(settings.cert_dir, Some(PathBuf::from("/tmp/certs")));
        assert_eq!(settings.cipher_policy.as_str(), "!CHACHA20");
    }

    #[test]
    fn zero_durations_are_rejected() {
        for key in ["poll_interval_ms", "handshake_timeout_ms", "connect_timeout_ms"] {
            let config = Config::builder().set_default(key, 0).unwrap().build().unwrap();
            match EngineSettings::from_config(&config) {
                Err(Error::InvalidSetting { key: rejected, .. }) => assert_eq!(rejected, key),
                other => panic!("{key}: expected InvalidSetting, got {other:?}"),
            }
        }
    }

    #[test]
    fn default_settings_are_valid() {
        assert!(EngineSettings::default().validate().is_ok());
        let settings = EngineSettings {
            poll_interval: Duration::ZERO,
            ..EngineSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(Error::InvalidSetting { key: "poll_interval_ms", .. })
        ));
    }
}
