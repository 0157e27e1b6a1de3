//! HTTP front end for the OCR pipeline.
//!
//! Endpoints:
//! - `GET /` - Browser upload page
//! - `POST /ocr` - OCR an uploaded PDF (raw body or multipart form)
//! - `GET /health` - Worker and scratch storage status

use std::{sync::Arc, time::Duration};

use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
    service::TowerToHyperService,
};
use tokio::{net::TcpListener, sync::watch};

use crate::{config::ServerOpts, pipeline::Orchestrator, prelude::*};

mod handlers;
mod routes;

pub use handlers::{FailureBody, HealthStatus};
pub use routes::create_router;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Serve until we receive Ctrl-C or `SIGTERM`, then finish in-flight
/// requests and return.
///
/// We drive connections with `hyper-util` directly, because `axum::serve`
/// has no way to bound how long idle keep-alive connections stay open.
#[instrument(level = "debug", skip_all)]
pub async fn serve(opts: &ServerOpts, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let app = create_router(AppState { orchestrator });

    let listener = TcpListener::bind((opts.host.as_str(), opts.port))
        .await
        .with_context(|| format!("failed to listen on {}:{}", opts.host, opts.port))?;
    let addr = listener
        .local_addr()
        .context("failed to get listening address")?;
    info!("Listening on http://{}", addr);

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .keep_alive(opts.keep_alive().is_some());
    if let Some(idle) = opts.keep_alive() {
        // The next request on a kept-alive connection must arrive this soon.
        builder.http1().header_read_timeout(idle);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually out of file descriptors. Back off a little.
                    warn!("failed to accept connection: {}", err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        trace!(%peer, "Accepted connection");

        let service = TowerToHyperService::new(app.clone());
        let builder = builder.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let mut closing = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(err) = result {
                            debug!(%peer, "connection ended with error: {}", err);
                        }
                        break;
                    }
                    _ = shutdown_rx.wait_for(|&stop| stop), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
            trace!(%peer, "Connection closed");
        });
    }

    drop(listener);
    drop(shutdown_rx);
    shutdown_tx.send_replace(true);
    info!(
        connections = shutdown_tx.receiver_count(),
        "Shutting down, waiting for open connections"
    );
    shutdown_tx.closed().await;
    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C or (on Unix) `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
