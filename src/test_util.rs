use std::sync::Arc;
use std::time::Duration;

use crate::config::{QuicTransportConfig, TlsMaterial};

/// Self-signed TLS material for loopback tests. The client side skips certificate
///  verification; production deployments bring their own material.
pub fn test_tls_material() -> TlsMaterial {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();

    let server = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert_der)],
            rustls::PrivateKey(key_der),
        )
        .unwrap();

    let client = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    TlsMaterial {
        client: Arc::new(client),
        server: Arc::new(server),
    }
}

/// Config for loopback tests: explicit bind addresses and timeouts short enough to keep
///  failure tests fast.
pub fn test_config(bind_addrs: Vec<String>, bind_port: u16) -> QuicTransportConfig {
    let mut cfg = QuicTransportConfig::new(test_tls_material());
    cfg.bind_addrs = bind_addrs;
    cfg.bind_port = bind_port;
    cfg.packet_dial_timeout = Duration::from_millis(500);
    cfg.packet_write_timeout = Duration::from_secs(1);
    cfg
}

/// Certificate verifier that accepts everything. Test use only.
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<SkipServerVerification> {
        Arc::new(SkipServerVerification)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
