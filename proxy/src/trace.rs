use chrono::Local;
use http::header::{HeaderMap, HeaderValue};
use rand::Rng;
use std::io;
use std::net::UdpSocket;
use std::time::{SystemTime, UNIX_EPOCH};

/// B3 propagation fields extracted from the inbound request, plus the span
/// this proxy contributes.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    /// Span id minted for this proxy's hop
    pub span_id: String,
    /// The caller's span id, if any
    pub parent_span_id: Option<String>,
    pub flags: Option<String>,
    pub sampled: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

impl TraceContext {
    /// Builds a trace context when the caller propagated a trace id. The
    /// caller's span becomes our parent and we mint a fresh span id.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let trace_id = header_str(headers, "x-b3-traceid")?;
        Some(TraceContext {
            trace_id,
            span_id: new_span_id(),
            parent_span_id: header_str(headers, "x-b3-spanid"),
            flags: header_str(headers, "x-b3-flags"),
            sampled: header_str(headers, "x-b3-sampled"),
        })
    }

    /// Rewrites the B3 headers for the egress request to the upstream.
    pub fn apply_egress_headers(&self, headers: &mut HeaderMap) {
        let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };
        set(headers, "x-b3-traceid", &self.trace_id);
        set(headers, "x-b3-spanid", &self.span_id);
        if let Some(parent) = &self.parent_span_id {
            set(headers, "x-b3-parentspanid", parent);
        }
        if let Some(flags) = &self.flags {
            set(headers, "x-b3-flags", flags);
        }
        if let Some(sampled) = &self.sampled {
            set(headers, "x-b3-sampled", sampled);
        }
    }
}

pub fn new_span_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Emits one syslog line per finished request span to the zipkin relay.
pub struct ZipkinReporter {
    socket: UdpSocket,
    addr: String,
    hostname: String,
    pid: u32,
}

impl ZipkinReporter {
    pub fn new(host: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(ZipkinReporter {
            socket,
            addr: format!("{host}:{port}"),
            hostname,
            pid: std::process::id(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn report(
        &self,
        trace: &TraceContext,
        start: SystemTime,
        end: SystemTime,
        client_ip: &str,
        cache_status: &str,
        method: &str,
        uri: &str,
    ) {
        let line = format_span_line(
            &self.hostname,
            self.pid,
            trace,
            start,
            end,
            client_ip,
            cache_status,
            method,
            uri,
        );
        if let Err(e) = self.socket.send_to(line.as_bytes(), &self.addr) {
            tracing::warn!("Failed to send zipkin span: {e}");
        }
    }
}

fn micros_since_epoch(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn format_span_line(
    hostname: &str,
    pid: u32,
    trace: &TraceContext,
    start: SystemTime,
    end: SystemTime,
    client_ip: &str,
    cache_status: &str,
    method: &str,
    uri: &str,
) -> String {
    let timestamp = Local::now().format("%b %d %H:%M:%S");
    let parent = trace.parent_span_id.as_deref().unwrap_or("-");
    let flags = trace.flags.as_deref().unwrap_or("-");
    let sampled = trace.sampled.as_deref().unwrap_or("-");
    format!(
        "<64>{timestamp} {hostname} nginx_spectre[{pid}]: spectre/zipkin {trace_id} {span_id} \
         {parent} {flags} {sampled} {start_us} {end_us}, client: {client_ip}, server: , \
         cache_status: {cache_status}, request: \"{method} {uri} HTTP/1.1\"",
        trace_id = trace.trace_id,
        span_id = trace.span_id,
        start_us = micros_since_epoch(start),
        end_us = micros_since_epoch(end),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b3_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-b3-traceid", HeaderValue::from_static("aaaa1111"));
        headers.insert("x-b3-spanid", HeaderValue::from_static("bbbb2222"));
        headers.insert("x-b3-sampled", HeaderValue::from_static("1"));
        headers
    }

    #[test]
    fn test_from_headers_requires_trace_id() {
        assert!(TraceContext::from_headers(&HeaderMap::new()).is_none());

        let trace = TraceContext::from_headers(&b3_headers()).unwrap();
        assert_eq!(trace.trace_id, "aaaa1111");
        assert_eq!(trace.parent_span_id.as_deref(), Some("bbbb2222"));
        assert_eq!(trace.sampled.as_deref(), Some("1"));
        assert_eq!(trace.span_id.len(), 16);
        assert_ne!(trace.span_id, "bbbb2222");
    }

    #[test]
    fn test_egress_headers() {
        let trace = TraceContext::from_headers(&b3_headers()).unwrap();
        let mut headers = HeaderMap::new();
        trace.apply_egress_headers(&mut headers);

        assert_eq!(headers.get("x-b3-traceid").unwrap(), "aaaa1111");
        assert_eq!(
            headers.get("x-b3-parentspanid").unwrap(),
            "bbbb2222"
        );
        assert_eq!(headers.get("x-b3-spanid").unwrap(), trace.span_id.as_str());
        assert_eq!(headers.get("x-b3-sampled").unwrap(), "1");
    }

    #[test]
    fn test_span_line_format() {
        let trace = TraceContext {
            trace_id: "tid".to_string(),
            span_id: "sid".to_string(),
            parent_span_id: None,
            flags: None,
            sampled: Some("1".to_string()),
        };
        let start = UNIX_EPOCH + Duration::from_micros(1_000_000);
        let end = UNIX_EPOCH + Duration::from_micros(2_000_000);

        let line = format_span_line(
            "host1",
            42,
            &trace,
            start,
            end,
            "10.0.0.1",
            "hit",
            "GET",
            "/biz/yelp-sf",
        );

        assert!(line.starts_with("<64>"));
        assert!(line.contains("host1 nginx_spectre[42]: spectre/zipkin tid sid - - 1"));
        assert!(line.contains("1000000 2000000"));
        assert!(line.contains("client: 10.0.0.1"));
        assert!(line.contains("cache_status: hit"));
        assert!(line.ends_with("request: \"GET /biz/yelp-sf HTTP/1.1\""));
    }

    #[test]
    fn test_span_ids_are_unique() {
        assert_ne!(new_span_id(), new_span_id());
    }
}
