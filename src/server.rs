//! Management API listener
//!
//! Routes:
//! - `POST /api/management/handshake`
//! - `POST /api/management/command`
//! - `GET /health`
//!
//! Connections are accepted here rather than by `axum::serve` so that the
//! verified client certificate of a TLS connection can be attached to every
//! request made on it.

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::SIGNATURE_HEADER;
use crate::handler::{CommandHandler, CommandResponse, ConnectionInfo};
use crate::tls::{self, TlsReloader};

pub const HANDSHAKE_PATH: &str = "/api/management/handshake";
pub const COMMAND_PATH: &str = "/api/management/command";
pub const HEALTH_PATH: &str = "/health";

/// Clients that stall the TLS handshake are dropped after this long
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the management router
pub fn router(handler: Arc<CommandHandler>, body_limit: usize) -> Router {
    Router::new()
        .route(HANDSHAKE_PATH, post(handshake))
        .route(COMMAND_PATH, post(command))
        .route(HEALTH_PATH, get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

fn signature(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
}

async fn handshake(
    State(handler): State<Arc<CommandHandler>>,
    conn: Option<Extension<ConnectionInfo>>,
    headers: HeaderMap,
    body: Bytes,
) -> CommandResponse {
    let conn = conn.map(|Extension(c)| c).unwrap_or_default();
    handler
        .handle_handshake(&conn, &body, signature(&headers))
        .await
}

async fn command(
    State(handler): State<Arc<CommandHandler>>,
    conn: Option<Extension<ConnectionInfo>>,
    headers: HeaderMap,
    body: Bytes,
) -> CommandResponse {
    let conn = conn.map(|Extension(c)| c).unwrap_or_default();
    handler
        .handle_text_command(&conn, &body, signature(&headers))
        .await
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Accept connections until `shutdown` resolves
///
/// With a [`TlsReloader`] every connection is terminated with the context
/// current at accept time; without one the listener speaks plain HTTP.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    tls: Option<Arc<TlsReloader>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let local = listener.local_addr()?;
    info!(
        "Management API listening on {} ({})",
        local,
        if tls.is_some() { "mTLS" } else { "plain HTTP" }
    );

    tokio::pin!(shutdown);
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("Management API shutting down");
                return Ok(());
            }
        };

        let app = app.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(reloader) => {
                    let acceptor = reloader.acceptor();
                    let stream =
                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                            .await
                        {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => {
                                debug!(%remote, "TLS handshake failed: {}", e);
                                return;
                            }
                            Err(_) => {
                                debug!(%remote, "TLS handshake timed out");
                                return;
                            }
                        };
                    let peer = tls::peer_identity(stream.get_ref().1);
                    debug!(%remote, peer = ?peer, "Accepted TLS connection");
                    serve_connection(stream, app, ConnectionInfo::new(Some(remote), peer)).await;
                }
                None => {
                    serve_connection(stream, app, ConnectionInfo::new(Some(remote), None)).await;
                }
            }
        });
    }
}

async fn serve_connection<I>(io: I, app: Router, info: ConnectionInfo)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(info.clone());
        app.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        debug!("Connection closed with error: {}", e);
    }
}
