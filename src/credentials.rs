//! Passphrase retrieval for encrypted server keys.

use zeroize::Zeroizing;

/// Placeholder passphrase used when none is configured.
///
/// An empty passphrase does not abort server startup: an unencrypted key loads
/// normally and an encrypted key is tried with this value.
pub const PLACEHOLDER_PASSPHRASE: &str = "dummy";

/// Supplies the secret needed to decrypt the server's private key.
///
/// Passed explicitly into server setup. The returned buffer is wiped when
/// dropped.
pub trait CredentialProvider {
    fn passphrase(&self) -> Zeroizing<Vec<u8>>;
}

/// A fixed passphrase, mostly useful in tests and scripted setups.
pub struct StaticPassphrase(Zeroizing<Vec<u8>>);

impl StaticPassphrase {
    pub fn new(passphrase: impl AsRef<[u8]>) -> Self {
        Self(Zeroizing::new(passphrase.as_ref().to_vec()))
    }
}

impl CredentialProvider for StaticPassphrase {
    fn passphrase(&self) -> Zeroizing<Vec<u8>> {
        self.0.clone()
    }
}

// Applies the placeholder fallback. Returns the passphrase and whether the
// placeholder was used.
pub(crate) fn resolve_passphrase(provider: &dyn CredentialProvider) -> (Zeroizing<Vec<u8>>, bool) {
    let passphrase = provider.passphrase();
    if passphrase.is_empty() {
        (
            Zeroizing::new(PLACEHOLDER_PASSPHRASE.as_bytes().to_vec()),
            true,
        )
    } else {
        (passphrase, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_passphrase_falls_back_to_placeholder() {
        let (passphrase, placeholder) = resolve_passphrase(&StaticPassphrase::new(""));
        assert!(placeholder);
        assert_eq!(passphrase.as_slice(), PLACEHOLDER_PASSPHRASE.as_bytes());
    }

    #[test]
    fn configured_passphrase_is_used() {
        let (passphrase, placeholder) = resolve_passphrase(&StaticPassphrase::new("s3cret"));
        assert!(!placeholder);
        assert_eq!(passphrase.as_slice(), b"s3cret");
    }
}
