//! HTTP CONNECT front-end on a hyper HTTP/1 server.
//!
//! The upstream is dialed before answering, so a client only ever sees
//! `200` for a tunnel that is already open. Any other method gets `405`.

use std::convert::Infallible;
use std::sync::Arc;

// ---

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ---

use burrow_domain::Target;

use super::{relay, TunnelDialer, SESSION_LIFETIME};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept HTTP proxy clients on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, dialer: Arc<TunnelDialer>, shutdown: CancellationToken) {
    // ---
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listen = %addr, "HTTP proxy listening");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("HTTP accept failed: {e}");
                continue;
            }
        };

        let dialer = Arc::clone(&dialer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| proxy(req, Arc::clone(&dialer), shutdown.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                tracing::debug!(%peer, "HTTP connection ended: {e}");
            }
        });
    }

    tracing::info!("HTTP proxy stopped");
}

// ---

async fn proxy(
    req: Request<Incoming>,
    dialer: Arc<TunnelDialer>,
    shutdown: CancellationToken,
) -> Result<Response<Full<Bytes>>, Infallible> {
    // ---
    if req.method() != Method::CONNECT {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "CONNECT only"));
    }

    let dest = match req.uri().authority().map(|a| Target::parse(a.as_str())) {
        Some(Ok(dest)) => dest,
        Some(Err(e)) => return Ok(text(StatusCode::BAD_REQUEST, e.to_string())),
        None => return Ok(text(StatusCode::BAD_REQUEST, "CONNECT needs host:port")),
    };

    let mut upstream = match dialer.dial(&dest).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(%dest, "CONNECT dial failed: {e}");
            return Ok(text(StatusCode::SERVICE_UNAVAILABLE, e.to_string()));
        }
    };

    tracing::debug!(%dest, "HTTP CONNECT");
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = relay(&mut client, &mut upstream, SESSION_LIFETIME) => {}
                }
            }
            Err(e) => tracing::warn!(%dest, "upgrade failed: {e}"),
        }
    });

    Ok(Response::new(Full::new(Bytes::new())))
}

// ---

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    // ---
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
