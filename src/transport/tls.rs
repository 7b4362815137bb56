//! TLS mimic
//!
//! Wraps the (possibly fragmented) TCP connection in TLS with a
//! browser-class ClientHello: cipher-suite ordering, ALPN list and session
//! resumption matching a real browser profile. The TLS layer is strictly a
//! protocol decoy — certificate verification is disabled and trust flows
//! through the PSK-authenticated envelope, so mismatched SNI/cert pairs are
//! expected. There is deliberately no knob to turn verification on.

use super::{BoxedIo, TransportError};
use crate::crypto::random_range;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme, SupportedCipherSuite};
use std::sync::Arc;
use tokio_rustls::{client::TlsStream, TlsAcceptor, TlsConnector};
use tracing::info;

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserProfile {
    /// Chrome 120+ (most common on the wire, the safest pick)
    #[default]
    Chrome,
    /// Firefox 121+
    Firefox,
    /// Safari 17+
    Safari,
    /// Random selection per connection
    Random,
}

impl BrowserProfile {
    /// Parse a profile tag from configuration
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "firefox" => Self::Firefox,
            "safari" => Self::Safari,
            "random" => Self::Random,
            _ => Self::Chrome,
        }
    }

    pub fn pick() -> Self {
        match random_range(0, 2) {
            0 => Self::Chrome,
            1 => Self::Firefox,
            _ => Self::Safari,
        }
    }

    /// User-Agent string matching this profile
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            Self::Firefox => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
            }
            Self::Safari => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
            Self::Random => Self::pick().user_agent(),
        }
    }

    /// ALPN list browsers offer (the tunnel speaks HTTP/1.1 either way; the
    /// list only shapes the ClientHello)
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    }
}

/// Certificate verifier that accepts any chain. Peer authenticity is
/// guaranteed by the AEAD layer with the PSK, not by the decoy TLS.
#[derive(Debug)]
struct DecoyVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for DecoyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a rustls ClientConfig shaped like the given browser profile.
pub fn build_client_config(profile: BrowserProfile) -> Result<ClientConfig, TransportError> {
    let profile = match profile {
        BrowserProfile::Random => BrowserProfile::pick(),
        p => p,
    };

    let provider = Arc::new(CryptoProvider {
        cipher_suites: cipher_suites_for(profile),
        ..ring_provider::default_provider()
    });

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DecoyVerifier(provider)))
        .with_no_client_auth();

    config.alpn_protocols = profile.alpn_protocols();
    config.resumption = rustls::client::Resumption::default();

    Ok(config)
}

/// TLS-handshake an already-dialed (and possibly fragmented) connection.
pub async fn connect_mimic(
    io: BoxedIo,
    sni: &str,
    profile: BrowserProfile,
) -> Result<TlsStream<BoxedIo>, TransportError> {
    let config = build_client_config(profile)?;
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid SNI {:?}: {}", sni, e)))?;

    connector
        .connect(server_name, io)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Build a server-side acceptor from PEM cert/key paths.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("bad certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates in {}", path)));
    }
    info!("loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path)))
}

/// Cipher suites ordered to match the browser profile
fn cipher_suites_for(profile: BrowserProfile) -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;

    match profile {
        BrowserProfile::Chrome => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        BrowserProfile::Firefox => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        BrowserProfile::Safari => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        BrowserProfile::Random => cipher_suites_for(BrowserProfile::pick()),
    }
}

/// JA3 fingerprint components, kept for debugging what a profile should look
/// like to a passive classifier.
#[derive(Debug, Clone)]
pub struct Ja3Components {
    pub version: u16,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl Ja3Components {
    pub fn for_profile(profile: BrowserProfile) -> Self {
        match profile {
            BrowserProfile::Chrome => Self {
                version: 0x0303,
                cipher_suites: vec![
                    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
                ],
                extensions: vec![
                    0x0000, 0x0017, 0xff01, 0x000a, 0x000b, 0x0023, 0x0010, 0x0005, 0x000d,
                    0x0012, 0x002b, 0x002d, 0x0033,
                ],
                curves: vec![0x001d, 0x0017, 0x0018],
                point_formats: vec![0x00],
            },
            BrowserProfile::Firefox => Self {
                version: 0x0303,
                cipher_suites: vec![
                    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030,
                ],
                extensions: vec![
                    0x0000, 0x0017, 0xff01, 0x000a, 0x000b, 0x0023, 0x0010, 0x0005, 0x000d,
                    0x002b, 0x002d, 0x0033, 0x001c,
                ],
                curves: vec![0x001d, 0x0017, 0x0018, 0x0019],
                point_formats: vec![0x00],
            },
            BrowserProfile::Safari => Self {
                version: 0x0303,
                cipher_suites: vec![
                    0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xc030, 0xc02f, 0xcca9, 0xcca8,
                ],
                extensions: vec![
                    0x0000, 0x0017, 0xff01, 0x000a, 0x000b, 0x0023, 0x0010, 0x0005, 0x000d,
                    0x002b, 0x002d, 0x0033,
                ],
                curves: vec![0x001d, 0x0017, 0x0018],
                point_formats: vec![0x00],
            },
            BrowserProfile::Random => Self::for_profile(BrowserProfile::pick()),
        }
    }

    pub fn ja3_string(&self) -> String {
        let join = |values: &[u16]| {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("-")
        };
        let points = self
            .point_formats
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("-");
        format!(
            "{},{},{},{},{}",
            self.version,
            join(&self.cipher_suites),
            join(&self.extensions),
            join(&self.curves),
            points
        )
    }

    pub fn ja3_hash(&self) -> String {
        format!("{:x}", md5::compute(self.ja3_string().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_configs() {
        for profile in [
            BrowserProfile::Chrome,
            BrowserProfile::Firefox,
            BrowserProfile::Safari,
            BrowserProfile::Random,
        ] {
            let config = build_client_config(profile).unwrap();
            assert!(config.alpn_protocols.contains(&b"h2".to_vec()));
        }
    }

    #[test]
    fn test_profile_tags() {
        assert_eq!(BrowserProfile::from_tag("firefox"), BrowserProfile::Firefox);
        assert_eq!(BrowserProfile::from_tag("SAFARI"), BrowserProfile::Safari);
        assert_eq!(BrowserProfile::from_tag("unknown"), BrowserProfile::Chrome);
    }

    #[test]
    fn test_user_agents_match_profiles() {
        assert!(BrowserProfile::Chrome.user_agent().contains("Chrome"));
        assert!(BrowserProfile::Firefox.user_agent().contains("Firefox"));
        assert!(BrowserProfile::Safari.user_agent().contains("Safari"));
    }

    #[test]
    fn test_ja3_differs_between_browsers() {
        let chrome = Ja3Components::for_profile(BrowserProfile::Chrome);
        let firefox = Ja3Components::for_profile(BrowserProfile::Firefox);
        assert_ne!(chrome.ja3_string(), firefox.ja3_string());
        assert_eq!(chrome.ja3_hash().len(), 32);
    }
}
