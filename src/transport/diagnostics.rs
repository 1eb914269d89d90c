//! Handshake summaries recorded into the context's diagnostic info.

use super::cipher::suite_name;
use super::TlsConnection;
use rustls::{ProtocolVersion, SupportedCipherSuite};

/// What a completed handshake negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSummary {
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub bits: Option<u16>,
}

impl HandshakeSummary {
    pub(crate) fn from_connection(conn: &TlsConnection) -> Self {
        let suite = conn.negotiated_cipher_suite();
        Self {
            protocol: conn.protocol_version().map(protocol_name),
            cipher: suite.as_ref().map(suite_name),
            bits: suite.as_ref().and_then(cipher_bits),
        }
    }

    /// One-line human-readable form. When the cipher is unknown only the
    /// protocol version and bit count are reported.
    pub fn render(&self) -> String {
        let protocol = self.protocol.as_deref().unwrap_or("unknown");
        match &self.cipher {
            Some(cipher) => {
                let bits = self
                    .bits
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "Info - Handshake complete - Algorithms: {cipher} - Algorithm bits: {bits} - Connection Protocol Version: {protocol}\n"
                )
            }
            None => format!(
                "No cipher information. Connection Protocol Version: {protocol} Bits: #{}\n",
                self.bits.unwrap_or(0)
            ),
        }
    }
}

fn protocol_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        other => format!("{other:?}"),
    }
}

/// Symmetric key strength of a suite, derived from its bulk cipher.
pub(crate) fn cipher_bits(suite: &SupportedCipherSuite) -> Option<u16> {
    bits_for_name(&suite_name(suite))
}

fn bits_for_name(name: &str) -> Option<u16> {
    if name.contains("AES_128") {
        Some(128)
    } else if name.contains("AES_256") || name.contains("CHACHA20") {
        Some(256)
    } else {
        None
    }
}
