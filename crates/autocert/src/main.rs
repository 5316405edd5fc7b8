//! autocert - automatic TLS certificate manager
//!
//! Serves HTTPS with certificates obtained on demand over ACME, and the
//! HTTP-01 responder on the plain-HTTP port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autocert::acme::http::serve_http_challenges;
use autocert::{Listener, Manager};
use autocert_common::observability::init_tracing;
use autocert_config::{AutocertConfig, CONFIG_ENV};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// autocert - automatic TLS certificates over ACME
#[derive(Parser, Debug)]
#[command(name = "autocert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = CONFIG_ENV, default_value = "autocert.kdl")]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and exit
    Check,
    /// Run the HTTPS server (default)
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check_config(&cli.config),
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run_server(&cli.config, cli.verbose))
        }
    }
}

/// Load and validate the configuration, then exit
fn check_config(path: &str) -> Result<()> {
    init_tracing("info", Default::default())?;

    let config = AutocertConfig::from_file(path).context("Configuration check failed")?;

    info!(
        directory = config.acme.directory(),
        allowed_hosts = config.hosts.allow.len(),
        host_patterns = config.hosts.patterns.len(),
        listen = %config.listener.address,
        "Configuration test successful"
    );
    println!("autocert: configuration file {} test is successful", path);
    Ok(())
}

async fn run_server(path: &str, verbose: bool) -> Result<()> {
    let config = AutocertConfig::from_file(path).context("Failed to load configuration file")?;

    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_tracing(level, config.logging.format)?;
    info!(path = %path, "Configuration loaded");

    let listen_addr: SocketAddr = config
        .listener
        .address
        .parse()
        .context("Invalid listener address")?;
    let http_addr: Option<SocketAddr> = config
        .listener
        .http_address
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("Invalid HTTP-01 listener address")?;

    let manager = Arc::new(Manager::from_config(config).context("Failed to create certificate manager")?);
    manager
        .start()
        .await
        .context("Failed to start certificate manager")?;

    let shutdown = manager.shutdown_token();

    if let Some(addr) = http_addr {
        let http_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP-01 responder on {}", addr))?;
        tokio::spawn(serve_http_challenges(
            http_listener,
            manager.http_challenge_service(),
            shutdown.clone(),
        ));
    }

    let listener = manager
        .listen(listen_addr)
        .await
        .with_context(|| format!("Failed to bind TLS listener on {}", listen_addr))?;

    info!(address = %listen_addr, "autocert started successfully");

    tokio::select! {
        _ = accept_loop(&listener, shutdown.clone()) => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown");
        }
    }

    if let Err(e) = listener.close() {
        warn!(error = %e, "TLS listener failed before close");
    }
    manager.shutdown().await;
    Ok(())
}

async fn accept_loop(listener: &Listener, shutdown: CancellationToken) {
    loop {
        let (connecting, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                    // Out of descriptors and similar conditions persist for a while
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        tokio::spawn(async move {
            let tls = match connecting.handshake().await {
                Ok(tls) => tls,
                Err(e) if e.is_challenge() => {
                    debug!(peer = %peer, "{}", e);
                    return;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let host = tls.get_ref().1.server_name().unwrap_or_default().to_string();
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let host = host.clone();
                async move { Ok::<_, hyper::Error>(greeting(&host, &req)) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Error serving HTTPS connection");
            }
        });
    }
}

fn greeting<B>(host: &str, req: &Request<B>) -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::from(format!(
        "Hello, TLS user! You reached {} at {}\n",
        host,
        req.uri().path()
    ))))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
