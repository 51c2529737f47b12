//! # TLS Listener Setup
//!
//! Builds the optional `TlsAcceptor` for the control/data listener. A
//! deployment either points at PEM cert/key files or lets the server
//! self-sign for its base domain at boot (useful for private networks,
//! where clients pin the generated certificate or skip TLS entirely).

use crate::config::TlsConfig;
use anyhow::Context as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub fn build_acceptor(config: &TlsConfig, domain: &str) -> anyhow::Result<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }

    let (certs, key) = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => load_pem(cert_path, key_path)?,
        _ => {
            info!(domain = %domain, "no cert/key configured, self-signing");
            self_signed(domain)?
        }
    };

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn load_pem(
    cert_path: &str,
    key_path: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("opening {cert_path}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {cert_path}"))?;
    anyhow::ensure!(!certs.is_empty(), "{cert_path} holds no certificates");

    let mut key_reader = BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("opening {key_path}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("reading private key from {key_path}"))?
        .with_context(|| format!("{key_path} holds no private key"))?;
    Ok((certs, key))
}

fn self_signed(domain: &str) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![
        domain.to_string(),
        format!("*.{domain}"),
    ])
    .context("generating self-signed certificate")?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    Ok((vec![cert], key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_builds_nothing() {
        let config = TlsConfig::default();
        assert!(build_acceptor(&config, "tunnel.test").unwrap().is_none());
    }

    #[test]
    fn self_signed_acceptor_builds() {
        let config = TlsConfig {
            enabled: true,
            cert_path: None,
            key_path: None,
        };
        // Needs a process-level crypto provider, as main installs.
        let _ = rustls::crypto::ring::default_provider().install_default();
        assert!(build_acceptor(&config, "tunnel.test").unwrap().is_some());
    }
}
