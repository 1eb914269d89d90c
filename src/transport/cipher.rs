//! Cipher-suite exclusion list.
//!
//! The list uses the familiar OpenSSL cipher-string syntax: colon-separated
//! tokens, where `!TOKEN` or `-TOKEN` excludes every suite matching `TOKEN`.
//! Positive tokens (`MEDIUM`, `HIGH`, `+AES`, ...) select from OpenSSL's
//! catalogue, which has no counterpart here, so they are ignored. Tokens
//! naming algorithms rustls never offers (NULL, 3DES, SHA-1, export grade)
//! are accepted and simply match nothing.

use crate::error::Error;
use rustls::crypto::CryptoProvider;
use rustls::SupportedCipherSuite;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Conservative default: no anonymous, NULL, 3DES, SHA-1 or export ciphers.
pub const DEFAULT_CIPHER_BLACKLIST: &str = "!aNULL:!eNULL:!3DES:!SHA1:!EXPORT:!EXPORT56:MEDIUM";

/// Environment variable overriding [`DEFAULT_CIPHER_BLACKLIST`].
pub const CIPHER_BLACKLIST_ENV: &str = "SCBLACKLIST";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Contains(String),
    StartsWith(&'static str),
    EndsWith(&'static str),
    // Algorithms rustls never negotiates.
    Nothing,
}

impl Matcher {
    fn from_token(token: &str) -> Self {
        match token {
            "aNULL" | "eNULL" | "NULL" | "COMPLEMENTOFALL" | "3DES" | "DES" | "RC2" | "RC4"
            | "MD5" | "EXP" | "EXPORT" | "EXPORT40" | "EXPORT56" | "LOW" | "ADH" | "AECDH"
            | "aDSS" | "DSS" | "PSK" | "SRP" | "CAMELLIA" | "IDEA" | "SEED" | "ARIA" | "kRSA" => {
                Matcher::Nothing
            }
            "SHA1" | "SHA" => Matcher::EndsWith("_SHA"),
            "SHA256" => Matcher::EndsWith("_SHA256"),
            "SHA384" => Matcher::EndsWith("_SHA384"),
            "AES128" => Matcher::Contains("AES_128".to_string()),
            "AES256" => Matcher::Contains("AES_256".to_string()),
            "AESGCM" => Matcher::Contains("GCM".to_string()),
            "CHACHA20" => Matcher::Contains("CHACHA20".to_string()),
            "ECDSA" | "aECDSA" => Matcher::Contains("_ECDSA_".to_string()),
            "RSA" | "aRSA" => Matcher::Contains("_RSA_".to_string()),
            "TLSv1.2" => Matcher::StartsWith("TLS_"),
            "TLSv1.3" => Matcher::StartsWith("TLS13_"),
            other => Matcher::Contains(other.to_ascii_uppercase().replace('-', "_")),
        }
    }

    fn matches(&self, suite_name: &str) -> bool {
        match self {
            Matcher::Contains(fragment) => suite_name.contains(fragment.as_str()),
            Matcher::StartsWith(prefix) => suite_name.starts_with(prefix),
            Matcher::EndsWith(suffix) => suite_name.ends_with(suffix),
            Matcher::Nothing => false,
        }
    }
}

/// Parsed cipher-suite exclusion list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherPolicy {
    spec: String,
    exclusions: Vec<Matcher>,
}

impl CipherPolicy {
    /// Parses an exclusion list such as `"!aNULL:!SHA1:!AES128"`.
    pub fn parse(spec: &str) -> Self {
        let mut exclusions = Vec::new();
        for token in spec.split([':', ',', ' ']).filter(|t| !t.is_empty()) {
            match token.strip_prefix('!').or_else(|| token.strip_prefix('-')) {
                Some(excluded) if !excluded.is_empty() => {
                    exclusions.push(Matcher::from_token(excluded));
                }
                _ => debug!(token, "Ignoring non-exclusion cipher token"),
            }
        }
        Self {
            spec: spec.to_string(),
            exclusions,
        }
    }

    /// Reads the exclusion list from `SCBLACKLIST`, falling back to the
    /// default. Call once at startup and pass the result in explicitly.
    pub fn from_env() -> Self {
        match std::env::var(CIPHER_BLACKLIST_ENV) {
            Ok(spec) => {
                info!(env = CIPHER_BLACKLIST_ENV, %spec, "Cipher blacklist overridden");
                Self::parse(&spec)
            }
            Err(_) => Self::default(),
        }
    }

    /// The list as originally written.
    pub fn as_str(&self) -> &str {
        &self.spec
    }

    /// Returns true if the named suite is excluded.
    pub fn excludes(&self, suite_name: &str) -> bool {
        self.exclusions.iter().any(|m| m.matches(suite_name))
    }

    /// Filters `suites` down to the ones this policy allows.
    pub fn filter(&self, suites: &[SupportedCipherSuite]) -> Vec<SupportedCipherSuite> {
        suites
            .iter()
            .copied()
            .filter(|suite| {
                let name = suite_name(suite);
                let excluded = self.excludes(&name);
                if excluded {
                    debug!(suite = %name, "Cipher suite excluded by blacklist");
                }
                !excluded
            })
            .collect()
    }

    /// Builds a crypto provider offering only the allowed suites.
    pub(crate) fn provider(&self) -> Result<Arc<CryptoProvider>, Error> {
        let base = rustls::crypto::ring::default_provider();
        let cipher_suites = self.filter(&base.cipher_suites);
        if cipher_suites.is_empty() {
            warn!(blacklist = %self.spec, "Cipher blacklist leaves no usable suites");
            return Err(Error::NoCipherSuites(self.spec.clone()));
        }
        Ok(Arc::new(CryptoProvider {
            cipher_suites,
            ..base
        }))
    }
}

impl Default for CipherPolicy {
    fn default() -> Self {
        Self::parse(DEFAULT_CIPHER_BLACKLIST)
    }
}

pub(crate) fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}
