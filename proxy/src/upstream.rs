use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use shared::http::filter_hop_by_hop;
use std::error::Error as StdError;
use std::time::Duration;
use tokio::time::timeout;

use crate::registry::Snapshot;
use crate::trace::TraceContext;
use crate::types::CasperResponse;

/// Forwards requests to the destination service and converts transport
/// failures into HTTP-shaped responses so the pipeline never has to unwind.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        UpstreamClient { client }
    }

    /// Builds the absolute upstream URL for `request_uri`. SmartStack gives
    /// the destination's address unless routing through Envoy is enabled, in
    /// which case the Envoy listener is the target and `X-Yelp-Svc` carries
    /// the destination.
    pub fn resolve(
        snapshot: &Snapshot,
        destination: &str,
        request_uri: &str,
    ) -> Option<(String, bool)> {
        if snapshot.internal.casper.route_through_envoy {
            if let Some(envoy) = &snapshot.envoy {
                return Some((
                    format!("http://{}:{}{}", envoy.host, envoy.port, request_uri),
                    true,
                ));
            }
        }
        let entry = snapshot.smartstack.get(destination)?;
        Some((
            format!("http://{}:{}{}", entry.host, entry.port, request_uri),
            false,
        ))
    }

    /// Sends the request and materializes the response. The deadline covers
    /// the whole cycle including body collection. Never returns an error:
    /// transport failures come back as synthetic 502/504/500 responses.
    pub async fn forward(
        &self,
        snapshot: &Snapshot,
        destination: &str,
        method: Method,
        request_uri: &str,
        mut headers: HeaderMap,
        body: Bytes,
        trace: Option<&TraceContext>,
        deadline: Duration,
    ) -> CasperResponse {
        let Some((url, via_envoy)) = Self::resolve(snapshot, destination, request_uri) else {
            return transport_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                request_uri,
                &format!("no smartstack entry for {destination}"),
            );
        };

        filter_hop_by_hop(&mut headers);
        if via_envoy {
            if let Ok(value) = HeaderValue::from_str(destination) {
                headers.insert("x-yelp-svc", value);
            }
        }
        if let Some(trace) = trace {
            trace.apply_egress_headers(&mut headers);
        }

        let mut builder = Request::builder().method(method).uri(&url);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = match builder.body(Full::new(body)) {
            Ok(request) => request,
            Err(e) => {
                return transport_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    request_uri,
                    &e.to_string(),
                )
            }
        };

        let round_trip = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| classify_client_error(&e))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| classify_hyper_error(&e))?;
            Ok::<_, (StatusCode, String)>((parts, body))
        };

        match timeout(deadline, round_trip).await {
            Err(_) => transport_response(StatusCode::GATEWAY_TIMEOUT, request_uri, "timeout"),
            Ok(Err((status, message))) => transport_response(status, request_uri, &message),
            Ok(Ok((mut parts, body))) => {
                filter_hop_by_hop(&mut parts.headers);
                CasperResponse::proxied(parts.status, parts.headers, body)
            }
        }
    }
}

/// A dropped connection maps to 502, anything else to 500 (§ timeouts are
/// handled by the deadline above).
fn classify_client_error(error: &hyper_util::client::legacy::Error) -> (StatusCode, String) {
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>() {
            return classify_hyper_error(hyper_error);
        }
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            if connection_dropped(io_error) {
                return (StatusCode::BAD_GATEWAY, "closed".to_string());
            }
        }
        source = cause.source();
    }
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn classify_hyper_error(error: &hyper::Error) -> (StatusCode, String) {
    if error.is_incomplete_message() || error.is_canceled() {
        return (StatusCode::BAD_GATEWAY, "closed".to_string());
    }
    if let Some(io_error) = error
        .source()
        .and_then(|cause| cause.downcast_ref::<std::io::Error>())
    {
        if connection_dropped(io_error) {
            return (StatusCode::BAD_GATEWAY, "closed".to_string());
        }
    }
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn connection_dropped(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

fn transport_response(status: StatusCode, request_uri: &str, message: &str) -> CasperResponse {
    CasperResponse::proxied(
        status,
        HeaderMap::new(),
        Bytes::from(format!("Error requesting {request_uri}: {message}")),
    )
}
