// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperBuilder;
use hyper_util::service::TowerToHyperService;
use kube::Client;
use log::{info, warn};
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::TcpListener;
use tokio_openssl::SslStream;

mod mutate;

const LISTEN_ADDR: &str = "0.0.0.0:8443";
const TLS_CERT_PATH: &str = "/tls/tls.crt";
const TLS_KEY_PATH: &str = "/tls/tls.key";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let client = Client::try_default()
        .await
        .context("build kubernetes client")?;

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/mutate-v1-pod", post(mutate::handle_mutate))
        .with_state(client);

    let addr: SocketAddr = LISTEN_ADDR.parse().context("parse listen address")?;
    serve_tls(addr, app).await
}

fn build_tls_acceptor() -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_modern(SslMethod::tls())
        .context("initialize TLS acceptor builder")?;
    builder
        .set_private_key_file(TLS_KEY_PATH, SslFiletype::PEM)
        .with_context(|| format!("load TLS key from {TLS_KEY_PATH}"))?;
    builder
        .set_certificate_chain_file(TLS_CERT_PATH)
        .with_context(|| format!("load TLS certificate from {TLS_CERT_PATH}"))?;
    builder
        .check_private_key()
        .context("TLS certificate and key mismatch")?;
    Ok(builder.build())
}

async fn serve_tls(addr: SocketAddr, app: Router) -> Result<()> {
    let acceptor = build_tls_acceptor()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind webhook listener at {addr}"))?;
    info!("Webhook server listening on {addr}");

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("accept incoming connection")?;
        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());

        tokio::spawn(async move {
            let ssl = match Ssl::new(acceptor.context()) {
                Ok(ssl) => ssl,
                Err(e) => {
                    warn!("Failed to initialize TLS session for {peer}: {e}");
                    return;
                }
            };
            let mut tls_stream = match SslStream::new(ssl, stream) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to bind TLS stream for {peer}: {e}");
                    return;
                }
            };
            if let Err(e) = Pin::new(&mut tls_stream).accept().await {
                warn!("TLS handshake with {peer} failed: {e}");
                return;
            }

            let io = TokioIo::new(tls_stream);
            if let Err(e) = HyperBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                warn!("Connection from {peer} ended with error: {e}");
            }
        });
    }
}
