//! `rendezvous-relay` — a streaming HTTP rendezvous relay.
//!
//! Parses CLI arguments into a [`cfg::ServerConfig`], installs logging,
//! builds the process-wide [`registry::PathRegistry`], and runs the HTTP
//! (and, if configured, HTTPS) listener until Ctrl-C or a listener task
//! exits unexpectedly. Mirrors the conventional split between a fallible
//! inner `main_main` and an infallible `main` that reports and exits.

mod body;
mod cfg;
mod err;
mod http;
mod multipart;
mod pipe;
mod registry;
mod tls;
mod trace;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures::Stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info};

use cfg::{Cli, ServerConfig};
use http::{HttpServer, Scheme};
use registry::PathRegistry;

#[tokio::main]
async fn main() {
    if let Err(err) = main_main().await {
        eprintln!("rendezvous-relay: {err}");
        std::process::exit(1);
    }
}

async fn main_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Arc::new(ServerConfig::from_cli(Cli::parse())?);
    trace::init(config.log_level);

    let registry = Arc::new(PathRegistry::new());
    let mut listeners: JoinSet<Result<(), std::convert::Infallible>> = JoinSet::new();

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_listener = TcpListener::bind(http_addr).await?;
    info!(addr = %http_addr, "listening (http)");
    let http_server = HttpServer::builder()
        .registry(Arc::clone(&registry))
        .config(Arc::clone(&config))
        .scheme(Scheme::Http)
        .build()?;
    listeners.spawn(async move {
        http_server
            .serve(TcpListenerStream::new(http_listener))
            .await
    });

    if let Some(https) = config.https.clone() {
        let acceptor = tls::acceptor(&https)?;
        let https_addr = SocketAddr::from(([0, 0, 0, 0], https.port));
        let https_listener = TcpListener::bind(https_addr).await?;
        info!(addr = %https_addr, "listening (https)");
        let https_server = HttpServer::builder()
            .registry(Arc::clone(&registry))
            .config(Arc::clone(&config))
            .scheme(Scheme::Https)
            .build()?;
        let stream = tls_accept_stream(https_listener, acceptor);
        listeners.spawn(async move { https_server.serve(stream).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        Some(result) = listeners.join_next() => {
            if let Err(join_err) = result {
                error!("listener task panicked: {join_err}");
            }
        }
    }

    Ok(())
}

/// Adapts a plain TCP accept loop wrapped in a TLS handshake into the
/// `Stream` of accepted connections [`HttpServer::serve`] expects.
fn tls_accept_stream(
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> impl Stream<Item = Result<TlsStream<TcpStream>, std::io::Error>> {
    futures::stream::unfold((listener, acceptor), |(listener, acceptor)| async move {
        let accepted = match listener.accept().await {
            Ok((stream, _peer)) => acceptor.accept(stream).await,
            Err(err) => Err(err),
        };
        Some((accepted, (listener, acceptor)))
    })
}
