use std::sync::{Arc, OnceLock};

use rustls::{ClientConfig, RootCertStore};

/// rustls 0.23 requires a process-level CryptoProvider selection.
///
/// When more than one provider feature is enabled in the dependency graph rustls cannot pick
/// a default and panics on the first config build, so ring is installed explicitly.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another provider is already installed; that one wins.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Client config trusting the bundled webpki roots, without client auth.
pub fn webpki_client_config() -> Arc<ClientConfig> {
    install_rustls_crypto_provider();
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webpki_config_builds_repeatedly() {
        let first = webpki_client_config();
        let second = webpki_client_config();
        assert!(first.alpn_protocols.is_empty());
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
