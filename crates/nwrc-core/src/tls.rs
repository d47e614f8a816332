//! TLS configuration and stream upgrades.
//!
//! Both sides build their rustls configs from the `ring` provider with an
//! explicit protocol version set (TLS 1.2 and 1.3 by default). Client
//! certificates are requested only when the server is given a root store to
//! verify them against.
//!
//! Upgrades run on an already connected [`TcpStream`] and produce a
//! [`Connection`] flagged as secure.

use std::sync::Arc;

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::{
    connection::Connection,
    error::{Result, TransportError},
};

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol versions offered during the TLS handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsVersions {
    /// TLS 1.2 and TLS 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersions {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12And13 => rustls::ALL_VERSIONS,
            Self::Tls13Only => TLS13_ONLY,
        }
    }
}

/// Server-side handshake settings.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Versions accepted from clients
    pub versions: TlsVersions,
    /// Roots client certificates must chain to; `None` disables client auth
    pub client_roots: Option<RootCertStore>,
}

/// Everything a client needs to upgrade a stream.
#[derive(Debug, Clone)]
pub struct TlsClientOptions {
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
}

impl TlsClientOptions {
    /// Use a prepared rustls config.
    pub fn new(server_name: &str, config: Arc<ClientConfig>) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TransportError::InvalidServerName(server_name.to_owned()))?;
        Ok(Self { server_name, config })
    }

    /// Trust exactly the certificates in `roots`.
    pub fn with_roots(server_name: &str, roots: RootCertStore) -> Result<Self> {
        Self::new(server_name, client_config(roots, TlsVersions::default(), None)?)
    }

    /// Trust the bundled Mozilla root set.
    pub fn with_webpki_roots(server_name: &str) -> Result<Self> {
        let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
        Self::with_roots(server_name, roots)
    }

    /// Name the server certificate is verified against.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

/// Everything a listener needs to upgrade accepted streams.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    config: Arc<ServerConfig>,
}

impl TlsServerOptions {
    /// Use a prepared rustls config.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Build from a certificate chain and its private key.
    pub fn from_pem_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        settings: &TlsSettings,
    ) -> Result<Self> {
        Ok(Self::new(server_config(certs, key, settings)?))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(error: impl ToString) -> TransportError {
    TransportError::Tls(error.to_string())
}

/// Build a server config presenting `certs`.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    settings: &TlsSettings,
) -> Result<Arc<ServerConfig>> {
    let builder = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(settings.versions.protocol_versions())
        .map_err(tls_error)?;

    let builder = match &settings.client_roots {
        Some(roots) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots.clone()), provider())
                    .build()
                    .map_err(tls_error)?;
            builder.with_client_cert_verifier(verifier)
        },
        None => builder.with_no_client_auth(),
    };

    let config = builder.with_single_cert(certs, key).map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// Build a client config trusting `roots`, optionally presenting `identity`.
pub fn client_config(
    roots: RootCertStore,
    versions: TlsVersions,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(versions.protocol_versions())
        .map_err(tls_error)?
        .with_root_certificates(roots);

    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key).map_err(tls_error)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Run the client side of the TLS handshake.
pub async fn connect(tcp: TcpStream, options: &TlsClientOptions) -> Result<Connection> {
    let peer = tcp.peer_addr().ok();
    tcp.set_nodelay(true)?;

    let connector = TlsConnector::from(Arc::clone(&options.config));
    let stream = connector.connect(options.server_name.clone(), tcp).await.map_err(tls_error)?;

    debug!(?peer, server_name = ?options.server_name, "TLS session established");
    Ok(Connection::secured(stream, peer))
}

/// Run the server side of the TLS handshake.
pub async fn accept(tcp: TcpStream, options: &TlsServerOptions) -> Result<Connection> {
    let peer = tcp.peer_addr().ok();
    tcp.set_nodelay(true)?;

    let acceptor = TlsAcceptor::from(Arc::clone(&options.config));
    let stream = acceptor.accept(tcp).await.map_err(tls_error)?;

    debug!(?peer, "TLS session accepted");
    Ok(Connection::secured(stream, peer))
}
