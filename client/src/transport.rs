//! # Server Transport
//!
//! Dials the rendezvous server (plain TCP or TLS) and runs compression
//! negotiation, yielding the boxed read/write halves every connection kind
//! (control and data alike) is built on.

use crate::config::ServerSection;
use anyhow::Context as _;
use fxtunnel_protocol::{negotiate, BoxedReader, BoxedWriter, Compression};
use rustls::pki_types::ServerName;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Opens one fresh transport to the server and performs the 1-byte
/// compression exchange.
pub async fn dial(server: &ServerSection) -> anyhow::Result<(BoxedReader, BoxedWriter, Compression)> {
    let stream = TcpStream::connect(&server.address)
        .await
        .with_context(|| format!("connecting to {}", server.address))?;
    stream.set_nodelay(true).ok();

    let offer = Compression::from_enabled(server.compression);
    let negotiated = if server.tls {
        let connector = tls_connector(server)?;
        let host = server
            .address
            .rsplit_once(':')
            .map_or(server.address.as_str(), |(h, _)| h);
        let name = ServerName::try_from(host.to_string())
            .with_context(|| format!("`{host}` is not a valid TLS server name"))?;
        let tls_stream = connector
            .connect(name, stream)
            .await
            .context("TLS handshake failed")?;
        negotiate(tls_stream, offer).await?
    } else {
        negotiate(stream, offer).await?
    };
    Ok(negotiated)
}

fn tls_connector(server: &ServerSection) -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(ca_path) = &server.tls_ca {
        let mut reader = BufReader::new(
            std::fs::File::open(ca_path).with_context(|| format!("opening {ca_path}"))?,
        );
        for cert in rustls_pemfile::certs(&mut reader) {
            roots
                .add(cert.with_context(|| format!("reading certificate from {ca_path}"))?)
                .with_context(|| format!("adding root from {ca_path}"))?;
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
