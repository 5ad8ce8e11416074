//! Test harness for relay integration tests.
//!
//! Provides helpers to spawn plain and TLS echo upstreams, relays, and TLS
//! clients on loopback.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use dotrelay::{InboundTls, ProxyConfig, RelayHandle, RelayServer, RetryPolicy};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A self-signed certificate with its PEM files on disk.
#[allow(dead_code)]
pub struct TestCert {
    pub cert_der: Vec<u8>,
    key_der: Vec<u8>,
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
}

#[allow(dead_code)]
impl TestCert {
    pub fn generate(server_name: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()]).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();

        Self {
            cert_der: cert.cert.der().to_vec(),
            key_der: cert.key_pair.serialize_der(),
            cert_file,
            key_file,
        }
    }

    pub fn cert_path(&self) -> &Path {
        self.cert_file.path()
    }

    pub fn inbound_tls(&self) -> InboundTls {
        InboundTls::new(self.cert_file.path(), self.key_file.path())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let certs = vec![CertificateDer::from(self.cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));

        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Echo every byte back until EOF, then close.
async fn echo<S>(mut stream: S, bytes: Arc<AtomicU64>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                bytes.fetch_add(n as u64, Ordering::Relaxed);
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
                if stream.flush().await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
    let _ = stream.shutdown().await;
}

#[allow(dead_code)]
pub struct EchoUpstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub active: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl EchoUpstream {
    /// Plain TCP echo server.
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_inner(None).await
    }

    /// TLS echo server using `cert`.
    pub async fn spawn_tls(cert: &TestCert) -> io::Result<Self> {
        Self::spawn_inner(Some(cert.acceptor())).await
    }

    async fn spawn_inner(acceptor: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let active = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let active_clone = Arc::clone(&active);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                active_clone.fetch_add(1, Ordering::Relaxed);
                                let active = Arc::clone(&active_clone);
                                let bytes = Arc::clone(&bytes_clone);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    match acceptor {
                                        Some(acceptor) => {
                                            if let Ok(tls) = acceptor.accept(stream).await {
                                                echo(tls, bytes).await;
                                            }
                                        }
                                        None => echo(stream, bytes).await,
                                    }
                                    active.fetch_sub(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            active,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Relay config pointing at `upstream`, listening on an ephemeral loopback port.
#[allow(dead_code)]
pub fn relay_config(upstream: SocketAddr) -> ProxyConfig {
    ProxyConfig::new(upstream.ip().to_string(), upstream.port())
        .with_connect_timeout(Duration::from_secs(1))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::no_retry())
        .with_shutdown_grace(Duration::from_millis(200))
}

/// Bind and start a relay.
#[allow(dead_code)]
pub async fn spawn_relay(config: ProxyConfig) -> RelayHandle {
    RelayServer::bind(config).await.unwrap().start()
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Write `payload` and read back exactly as many bytes.
#[allow(dead_code)]
pub async fn roundtrip<S>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(TEST_TIMEOUT, async {
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "roundtrip timed out"))?
}

/// Resolve once the peer closes: true for EOF or reset, false on timeout.
#[allow(dead_code)]
pub async fn closed_within<S>(stream: &mut S, limit: Duration) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    match timeout(limit, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) => false,
        Err(_) => false,
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// TLS client trusting only `cert_der`.
#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    timeout(TEST_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS connect timed out"))?
}
