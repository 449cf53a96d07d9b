//! HTTP server and response shaping
//!
//! hyper http1 with TokioIo, one spawned task per connection. The handler
//! surface is deliberately thin: parse the path, hand the params to the
//! gateway, shape the outcome into a response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::context::Cx;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::urlpath;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

type Body = Full<Bytes>;

/// Accept loop. Runs until the listener fails or the task is dropped.
pub async fn run(app: Arc<Gateway>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("darkroom {} listening on {}", VERSION, addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let app = Arc::clone(&app);
                        async move {
                            Ok::<_, Infallible>(respond(app, req.uri().path()).await)
                        }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(peer = %peer, error = ?err, "connection closed with error");
                    }
                });
            }
            Err(err) => error!(error = ?err, "accept failed"),
        }
    }
}

/// Handle one escaped request path end to end
pub async fn respond(app: Arc<Gateway>, path: &str) -> Response<Body> {
    if path.is_empty() || path == "/" {
        return json(
            StatusCode::OK,
            format!(r#"{{"darkroom":{{"version":"{VERSION}"}}}}"#),
        );
    }
    let params = urlpath::parse(path);
    if params.params {
        let body = serde_json::to_string_pretty(&params)
            .unwrap_or_else(|_| r#"{"code":500,"message":"internal"}"#.into());
        return json(StatusCode::OK, body);
    }
    let meta_requested = params.meta;

    let served = app.execute(&Cx::root(), params).await;

    let mut body = Bytes::new();
    let mut content_type = None;
    if let Some(blob) = &served.blob {
        if !blob.is_empty() {
            if let Some(meta) = blob.meta() {
                if meta_requested {
                    let body = serde_json::to_string(meta)
                        .unwrap_or_else(|_| r#"{"code":500,"message":"internal"}"#.into());
                    return json(StatusCode::OK, body);
                }
                content_type = Some(meta.content_type.clone());
            } else {
                content_type = Some(blob.sniff_content_type().to_string());
            }
            body = blob.bytes().clone();
        }
    }

    if let Some(err) = served.err {
        // the pass sentinel must never reach the wire
        let err = if err.is_pass() { Error::NotFound } else { err };
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !body.is_empty() {
            // ship the fallback body with the error status
            let mut response = Response::builder().status(status);
            if let Some(ct) = content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            return response
                .header(header::CONTENT_LENGTH, body.len())
                .body(Full::new(body))
                .expect("static response");
        }
        return json(status, err.to_json());
    }

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(ct) = content_type {
        response = response.header(header::CONTENT_TYPE, ct);
    }
    let ttl = app.cache_header_ttl();
    response = response
        .header(header::EXPIRES, expires_header(ttl))
        .header(header::CACHE_CONTROL, cache_control(ttl));
    response.body(Full::new(body)).expect("static response")
}

fn json(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

fn expires_header(ttl: Duration) -> String {
    let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
    expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn cache_control(ttl: Duration) -> String {
    if ttl.is_zero() {
        return "private, no-cache, no-store, must-revalidate".to_string();
    }
    let secs = ttl.as_secs();
    format!("public, s-maxage={secs}, max-age={secs}, no-transform")
}
