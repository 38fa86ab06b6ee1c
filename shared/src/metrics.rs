use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

/// Metric payload types understood by the relay.
#[derive(Clone, Copy)]
enum RelayMetricType {
    Counter,
    Timer,
    Gauge,
}

impl RelayMetricType {
    fn as_str(&self) -> &'static str {
        match self {
            RelayMetricType::Counter => "c",
            RelayMetricType::Timer => "ms",
            RelayMetricType::Gauge => "g",
        }
    }
}

enum MetricsBackend {
    Relay(RelayClient),
    Noop,
}

/// Client for the UDP metrics relay.
///
/// Payload format, one metric per datagram:
/// `[["<dim>", "<val>"], ..., ["metric_name", "<name>"]]:<value>|<type>`
/// Default dimensions are prepended to the per-call dimensions.
struct RelayClient {
    socket: UdpSocket,
    addr: String,
    default_dims: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Metrics {
    backend: Arc<MetricsBackend>,
}

impl Metrics {
    /// Create a new Metrics client that sends to the relay over UDP
    pub fn new_relay(
        host: &str,
        port: u16,
        default_dims: Vec<(String, String)>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let client = RelayClient {
            socket,
            addr: format!("{host}:{port}"),
            default_dims,
        };

        Ok(Metrics {
            backend: Arc::new(MetricsBackend::Relay(client)),
        })
    }

    /// Create a no-op Metrics client that discards all metrics
    pub fn new_noop() -> Self {
        Metrics {
            backend: Arc::new(MetricsBackend::Noop),
        }
    }

    /// Increment a counter metric by 1
    /// metrics.count("spectre.hit_rate", &[("cache_status", "hit")]);
    pub fn count(&self, metric: &str, dims: &[(&str, &str)]) {
        self.send(metric, 1, RelayMetricType::Counter, dims);
    }

    /// Record a timing metric in milliseconds
    pub fn timing(&self, metric: &str, value_ms: u64, dims: &[(&str, &str)]) {
        self.send(metric, value_ms, RelayMetricType::Timer, dims);
    }

    /// Record a gauge value
    pub fn gauge(&self, metric: &str, value: u64, dims: &[(&str, &str)]) {
        self.send(metric, value, RelayMetricType::Gauge, dims);
    }

    fn send(&self, metric: &str, value: u64, metric_type: RelayMetricType, dims: &[(&str, &str)]) {
        let client = match self.backend.as_ref() {
            MetricsBackend::Relay(client) => client,
            MetricsBackend::Noop => return,
        };

        let payload = encode_payload(&client.default_dims, dims, metric, value, metric_type);
        if let Err(e) = client.socket.send_to(payload.as_bytes(), &client.addr) {
            tracing::warn!("Failed to send metric: {e}");
        }
    }
}

fn encode_payload(
    default_dims: &[(String, String)],
    dims: &[(&str, &str)],
    metric: &str,
    value: u64,
    metric_type: RelayMetricType,
) -> String {
    let mut pairs: Vec<[&str; 2]> = Vec::with_capacity(default_dims.len() + dims.len() + 1);
    for (name, val) in default_dims {
        pairs.push([name, val]);
    }
    for (name, val) in dims {
        pairs.push([name, val]);
    }
    pairs.push(["metric_name", metric]);

    // serde_json never fails on a list of string pairs
    let dims_json = serde_json::to_string(&pairs).unwrap_or_default();
    format!("{dims_json}:{value}|{}", metric_type.as_str())
}
