use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept loop for a hyper service: binds `host:port`, hands each connection
/// to hyper's auto h1/h2 builder on its own task.
pub async fn run_http_service<S, B, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

// Hop-by-hop headers are connection-specific and must not cross the proxy:
// - the standard hop-by-hop set
// - any extra headers listed in the Connection header value
// - keep-alive
// Content-Length is also dropped because bodies are re-materialized and the
// length is recomputed on egress.
pub fn filter_hop_by_hop(headers: &mut HeaderMap) -> &mut HeaderMap {
    // Parse the Connection header to find additional headers to drop
    let mut extra_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION) {
        if let Ok(s) = connection.to_str() {
            for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
                if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                    extra_drops.push(name);
                }
            }
        }
    }

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }

    for name in extra_drops {
        headers.remove(&name);
    }

    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(CONTENT_LENGTH);

    headers
}

/// Reads every value of a header as a string, in insertion order.
pub fn all_header_values<'a>(headers: &'a HeaderMap, name: &str) -> Vec<&'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v: &HeaderValue| v.to_str().ok())
        .collect()
}

/// Creates an error response with the given body, or the status message when
/// no body is supplied.
pub fn make_error_response(status_code: StatusCode, body: Option<String>) -> Response<Bytes> {
    let message = match body {
        Some(body) => Bytes::from(body),
        None => Bytes::from(
            status_code
                .canonical_reason()
                .unwrap_or("an error occurred"),
        ),
    };

    let mut response = Response::new(message);
    *response.status_mut() = status_code;
    response
}

/// Boxed version for services that need BoxBody
pub fn make_boxed_error_response<E>(
    status_code: StatusCode,
    body: Option<String>,
) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    make_error_response(status_code, body)
        .map(Full::new)
        .map(|body| body.map_err(|e| match e {}).boxed())
}
