//! Command-line entry points.
//!
//! - `serve`: run an Echo server, plaintext or TLS
//! - `ping`: connect, negotiate, echo one message and report the round trip

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use nwrc_core::{
    Client, ClientConfig, ProtocolRegistry, Server, ServerConfig, TlsClientOptions,
    TlsServerOptions, TlsSettings, TlsVersions, TransportError,
};
use thiserror::Error;
use tracing::info;

use crate::{
    cert::{self, CertificateError, Identity},
    echo::{self, ECHO_PROTOCOL_NAME},
};

/// Errors surfaced to the command line.
#[derive(Debug, Error)]
pub enum CliError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Certificate loading or generation failure
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Invalid flag combination
    #[error("{0}")]
    Usage(String),

    /// Waiting for the shutdown signal failed
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// NWRC echo server and ping client.
#[derive(Debug, Parser)]
#[command(name = "nwrc-server", version, about)]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    /// What to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an Echo server
    Serve(ServeArgs),
    /// Echo one message against a server
    Ping(PingArgs),
}

/// Options for `serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = 4433)]
    pub port: u16,

    /// PEM certificate chain; enables TLS together with --key
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Serve TLS with a freshly generated self-signed certificate
    #[arg(long, conflicts_with = "cert")]
    pub self_signed: bool,

    /// Host names for the self-signed certificate
    #[arg(long, default_value = "localhost")]
    pub san: Vec<String>,

    /// Refuse TLS 1.2
    #[arg(long)]
    pub tls13_only: bool,

    /// Require client certificates chaining to this PEM bundle
    #[arg(long)]
    pub client_ca: Option<PathBuf>,
}

/// Options for `ping`.
#[derive(Debug, Args)]
pub struct PingArgs {
    /// Server host name or address
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    /// Server port
    #[arg(short, long, default_value_t = 4433)]
    pub port: u16,

    /// Payload to echo
    #[arg(short, long, default_value = "ping")]
    pub message: String,

    /// Connect over TLS, verifying the server against this name
    #[arg(long)]
    pub server_name: Option<String>,

    /// PEM bundle to trust instead of the bundled web roots
    #[arg(long, requires = "server_name")]
    pub ca: Option<PathBuf>,

    /// Seconds to wait for the handshake
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout: u64,
}

/// Registry with every protocol this binary speaks.
pub fn registry() -> Arc<ProtocolRegistry> {
    let registry = Arc::new(ProtocolRegistry::new());
    echo::register(&registry);
    registry
}

fn server_tls(args: &ServeArgs) -> Result<Option<TlsServerOptions>, CliError> {
    let identity = match (&args.cert, &args.key, args.self_signed) {
        (Some(cert), Some(key), _) => cert::load_identity(cert, key)?,
        (None, None, true) => {
            info!(names = ?args.san, "generating self-signed certificate");
            cert::self_signed(&args.san)?
        },
        (None, None, false) => return Ok(None),
        _ => return Err(CliError::Usage("--cert and --key must be given together".into())),
    };

    let client_roots = match &args.client_ca {
        Some(path) => Some(cert::root_store(&cert::load_certs(path)?)?),
        None => None,
    };
    let versions = if args.tls13_only { TlsVersions::Tls13Only } else { TlsVersions::Tls12And13 };

    let Identity { certs, key } = identity;
    let options =
        TlsServerOptions::from_pem_parts(certs, key, &TlsSettings { versions, client_roots })?;
    Ok(Some(options))
}

/// Run the server until Ctrl-C.
pub async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let mut config = ServerConfig::new(args.port)
        .with_bind(args.bind)
        .with_groups([ECHO_PROTOCOL_NAME])
        .with_registry(registry());
    if let Some(tls) = server_tls(&args)? {
        config = config.with_tls(tls);
    }

    let server = Server::start(config).await?;
    info!(local_addr = %server.local_addr(), "ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}

fn client_tls(args: &PingArgs) -> Result<Option<TlsClientOptions>, CliError> {
    let Some(server_name) = &args.server_name else {
        return Ok(None);
    };
    let options = match &args.ca {
        Some(path) => {
            let roots = cert::root_store(&cert::load_certs(path)?)?;
            TlsClientOptions::with_roots(server_name, roots)?
        },
        None => TlsClientOptions::with_webpki_roots(server_name)?,
    };
    Ok(Some(options))
}

/// Echo one message and log the round trip.
pub async fn ping(args: PingArgs) -> Result<(), CliError> {
    let mut config = ClientConfig::new(args.address.clone(), args.port)
        .with_groups([ECHO_PROTOCOL_NAME])
        .with_registry(registry())
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout));
    if let Some(tls) = client_tls(&args)? {
        config = config.with_tls(tls);
    }

    let connected = Instant::now();
    let client = Client::connect(&config).await?;
    let negotiated = connected.elapsed();

    let sent = Instant::now();
    let reply = echo::echo(&client, args.message.as_bytes()).await?;
    let round_trip = sent.elapsed();

    if reply != args.message.as_bytes() {
        client.close().await;
        return Err(CliError::Usage("server echoed different bytes".into()));
    }

    info!(
        address = %args.address,
        port = args.port,
        secure = client.endpoint().is_secure(),
        bytes = reply.len(),
        ?negotiated,
        ?round_trip,
        "pong"
    );
    client.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults_to_plaintext() {
        let cli = Cli::parse_from(["nwrc-server", "serve", "--port", "0"]);
        let Command::Serve(args) = cli.command else { panic!("expected serve") };
        assert!(server_tls(&args).unwrap().is_none());
    }

    #[test]
    fn self_signed_enables_tls() {
        let cli = Cli::parse_from(["nwrc-server", "serve", "--self-signed", "--tls13-only"]);
        let Command::Serve(args) = cli.command else { panic!("expected serve") };
        assert!(server_tls(&args).unwrap().is_some());
    }

    #[test]
    fn cert_requires_key() {
        let result = Cli::try_parse_from(["nwrc-server", "serve", "--cert", "cert.pem"]);
        assert!(result.is_err());
    }

    #[test]
    fn ping_with_server_name_uses_tls() {
        let cli = Cli::parse_from(["nwrc-server", "ping", "--server-name", "example.com"]);
        let Command::Ping(args) = cli.command else { panic!("expected ping") };
        assert!(client_tls(&args).unwrap().is_some());
        assert_eq!(args.message, "ping");
    }
}
