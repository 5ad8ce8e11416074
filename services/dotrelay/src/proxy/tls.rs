//! TLS termination (inbound) and origination (outbound).
//!
//! Certificate material is loaded once at startup; any problem there is a
//! fatal [`ProxyError::CertLoad`]. Per-connection handshake failures only
//! close the connection that failed.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::config::InboundTls;
use crate::error::{ProxyError, Result};

/// The crypto provider used for every TLS config the relay builds.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| ProxyError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::cert_load(path, e))?;

    if certs.is_empty() {
        return Err(ProxyError::cert_load(path, "no certificates found"));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#1, PKCS#8 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| ProxyError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::cert_load(path, e))?
        .ok_or_else(|| ProxyError::cert_load(path, "no private key found"))
}

/// Server-side TLS handshakes for accepted connections.
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    /// Build a terminator from a certificate chain and key on disk.
    pub fn from_files(tls: &InboundTls, handshake_timeout: Duration) -> Result<Self> {
        let certs = load_certs(&tls.cert_path)?;
        let key = load_private_key(&tls.key_path)?;

        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::cert_load(&tls.cert_path, e))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::cert_load(&tls.key_path, e))?;

        info!(
            cert = %tls.cert_path.display(),
            key = %tls.key_path.display(),
            "Loaded inbound TLS certificate"
        );

        Ok(Self::from_config(Arc::new(config), handshake_timeout))
    }

    pub fn from_config(config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    /// Run the server handshake on an accepted socket.
    ///
    /// On failure the socket is dropped, closing it.
    pub async fn accept(&self, stream: TcpStream) -> Result<server::TlsStream<TcpStream>> {
        match timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => {
                debug!(
                    protocol = ?tls.get_ref().1.protocol_version(),
                    "Inbound TLS handshake complete"
                );
                Ok(tls)
            }
            Ok(Err(e)) => Err(ProxyError::Handshake(e.to_string())),
            Err(_) => Err(ProxyError::Handshake(format!(
                "timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

/// Client-side TLS handshakes toward the upstream.
#[derive(Clone)]
pub struct TlsOriginator {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

impl TlsOriginator {
    /// Build an originator trusting the webpki roots plus `extra_ca`.
    pub fn new(
        server_name: &str,
        extra_ca: Option<&Path>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = extra_ca {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::cert_load(path, e))?;
            }
            info!(ca = %path.display(), "Loaded upstream CA certificates");
        }

        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Config(format!("failed to create TLS config: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self::from_config(Arc::new(config), server_name, handshake_timeout)
    }

    pub fn from_config(
        config: Arc<ClientConfig>,
        server_name: &str,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            ProxyError::Config(format!("invalid upstream TLS name '{}': {}", server_name, e))
        })?;

        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
            handshake_timeout,
        })
    }

    /// Run the client handshake over an established upstream socket.
    pub async fn connect(&self, stream: TcpStream) -> std::io::Result<client::TlsStream<TcpStream>> {
        match timeout(
            self.handshake_timeout,
            self.connector.connect(self.server_name.clone(), stream),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "TLS handshake timeout",
            )),
        }
    }
}
