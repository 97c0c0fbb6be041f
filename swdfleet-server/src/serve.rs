use std::net::SocketAddr;
use std::time::Duration;

use axum::{Extension, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::api::security::ClientAddr;

/// How long in-flight connections get to finish after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// Protects against peers that dribble request headers.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts connections until `cancel` fires, serving each on its own task,
/// then drains in-flight work with a bounded deadline. With a TLS acceptor
/// every connection is handshaken before it is served.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, draining connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let app = app.clone();
                        let tls = tls.clone();
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            handle_connection(stream, peer, app, tls, cancel).await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "error accepting connection");
                    }
                }
            }
        }
    }

    tracker.close();
    if tokio::time::timeout(DRAIN_DEADLINE, tracker.wait()).await.is_err() {
        warn!("drain deadline reached, abandoning in-flight connections");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    // The socket peer rides along as an extension so the security layer can
    // resolve the client IP without a proxy header.
    let app = app.layer(Extension(ClientAddr(peer)));

    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => drive(TokioIo::new(tls_stream), app, cancel, peer).await,
            Err(err) => debug!(%peer, error = %err, "tls handshake failed"),
        },
        None => drive(TokioIo::new(stream), app, cancel, peer).await,
    }
}

async fn drive<I>(io: I, app: Router, cancel: CancellationToken, peer: SocketAddr)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        app.clone().oneshot(request.map(axum::body::Body::new))
    });

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let conn = builder.serve_connection_with_upgrades(io, hyper_service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(%peer, error = %err, "connection closed with error");
            }
        }
        _ = cancel.cancelled() => {
            // Let in-flight requests complete; the tracker bounds the wait.
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(%peer, error = %err, "connection closed with error during drain");
            }
        }
    }
}
