//! HTTP/1.1 transport that times each connection phase.
//!
//! Every exchange opens its own connection so DNS, TCP connect and TLS
//! handshake are measured per request. A phase that never completes keeps a
//! zero timing.

use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use super::ClientError;
use crate::response::ResponseMetrics;

/// Target parsed from a base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub tls: bool,
    /// Host without IPv6 brackets, used for resolution and SNI
    pub host: String,
    pub port: u16,
    /// Value of the `Host` header
    pub authority: String,
    /// Path prefix without trailing slash
    pub base_path: String,
}

impl Endpoint {
    pub fn parse(base_url: &str) -> Result<Self, String> {
        let uri: Uri = base_url.trim().parse().map_err(|e| format!("{}", e))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => return Err(format!("unsupported scheme '{}'", other)),
            None => return Err("missing scheme".to_string()),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| "missing host".to_string())?
            .as_str()
            .to_string();
        let host = uri
            .host()
            .ok_or_else(|| "missing host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            tls,
            host,
            port,
            authority,
            base_path,
        })
    }
}

pub type Sender = SendRequest<Full<Bytes>>;

#[derive(Clone)]
pub struct Transport {
    tls: TlsConnector,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Transport trusting the webpki root set.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_tls_config(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Transport using `config` for TLS endpoints. ALPN is pinned to
    /// http/1.1 since the connection is always driven as HTTP/1.
    pub fn with_tls_config(mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Open a fresh connection, recording phase timings into `metrics` as
    /// each phase completes.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        metrics: &mut ResponseMetrics,
    ) -> Result<Sender, ClientError> {
        let started = Instant::now();
        let addrs: Vec<SocketAddr> = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ClientError::Dns(format!("{}: {}", endpoint.host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ClientError::Dns(format!(
                "{}: no addresses found",
                endpoint.host
            )));
        }
        metrics.dns_time = started.elapsed();

        let started = Instant::now();
        let (tcp, addr) = connect_any(&addrs).await?;
        metrics.connect_time = started.elapsed();
        metrics.target_ip = Some(addr.ip());
        let _ = tcp.set_nodelay(true);

        if !endpoint.tls {
            return handshake(tcp).await;
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {}", e)))?;
        let started = Instant::now();
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        metrics.tls_handshake_time = started.elapsed();

        handshake(stream).await
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), ClientError> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, *addr)),
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_error = Some(format!("{}: {}", addr, e));
            }
        }
    }
    Err(ClientError::Connection(
        last_error.unwrap_or_else(|| "no addresses to connect to".to_string()),
    ))
}

async fn handshake<S>(io: S) -> Result<Sender, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ClientError::Connection(format!("http handshake: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("connection closed with error: {}", e);
        }
    });

    Ok(sender)
}

/// TLS fixtures: a test CA and a `127.0.0.1`/`localhost` leaf it signed,
/// both valid until 2126.
#[cfg(test)]
pub(super) mod fixtures {
    use super::*;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    const CA_CERT: &[u8] = include_bytes!("testdata/ca.der");
    const SERVER_CERT: &[u8] = include_bytes!("testdata/server.der");
    const SERVER_KEY: &[u8] = include_bytes!("testdata/server.key.der");

    pub fn acceptor() -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(SERVER_KEY.to_vec()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(SERVER_CERT.to_vec())], key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }

    /// Transport that trusts only the test CA.
    pub fn trusting_transport() -> Transport {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(CA_CERT.to_vec())).unwrap();
        Transport::with_tls_config(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}
