use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use shared::metrics::Metrics;

/// All emission points of the proxy: the UDP relay (dimensioned counters and
/// timers) plus a Prometheus registry behind `GET /metrics`.
pub struct ProxyMetrics {
    relay: Metrics,
    registry: Registry,
    requests_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    cache_stores_total: IntCounterVec,
    request_duration_ms: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(relay: Metrics) -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("casper_requests_total", "Proxied requests by status"),
            &["namespace", "status"],
        )
        .expect("valid metric definition");
        let cache_lookups_total = IntCounterVec::new(
            Opts::new("casper_cache_lookups_total", "Cache lookups by outcome"),
            &["namespace", "cache_name", "cache_status"],
        )
        .expect("valid metric definition");
        let cache_stores_total = IntCounterVec::new(
            Opts::new("casper_cache_stores_total", "Responses written to storage"),
            &["namespace", "cache_name"],
        )
        .expect("valid metric definition");
        let request_duration_ms = HistogramVec::new(
            HistogramOpts::new("casper_request_duration_ms", "Request timing in ms").buckets(
                vec![1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0],
            ),
            &["namespace", "cache_name"],
        )
        .expect("valid metric definition");

        for collector in [&requests_total, &cache_lookups_total, &cache_stores_total] {
            registry
                .register(Box::new(collector.clone()))
                .expect("collector registers once");
        }
        registry
            .register(Box::new(request_duration_ms.clone()))
            .expect("collector registers once");

        ProxyMetrics {
            relay,
            registry,
            requests_total,
            cache_lookups_total,
            cache_stores_total,
            request_duration_ms,
        }
    }

    pub fn noop() -> Self {
        Self::new(Metrics::new_noop())
    }

    /// One cache lookup finished (per bulk id, or once for a single
    /// endpoint).
    pub fn fetch(&self, namespace: &str, cache_name: &str, cache_status: &str) {
        let dims = &[
            ("namespace", namespace),
            ("cache_name", cache_name),
            ("cache_status", cache_status),
        ];
        self.relay.count("spectre.fetch_body_and_headers", dims);
        self.relay.count("spectre.hit_rate", dims);
        self.cache_lookups_total
            .with_label_values(&[namespace, cache_name, cache_status])
            .inc();
    }

    pub fn store(&self, namespace: &str, cache_name: &str) {
        self.relay.count(
            "spectre.store_body_and_headers",
            &[("namespace", namespace), ("cache_name", cache_name)],
        );
        self.cache_stores_total
            .with_label_values(&[namespace, cache_name])
            .inc();
    }

    pub fn bulk_hit_rate(&self, namespace: &str, cache_name: &str, cache_status: &str) {
        self.relay.count(
            "spectre.bulk_hit_rate",
            &[
                ("namespace", namespace),
                ("cache_name", cache_name),
                ("cache_status", cache_status),
            ],
        );
    }

    pub fn no_cache_header(&self, namespace: &str, cache_name: &str, reason: &str) {
        self.relay.count(
            "spectre.no_cache_header",
            &[
                ("namespace", namespace),
                ("reason", reason),
                ("cache_name", cache_name),
            ],
        );
    }

    /// Request timing goes out four times, over the cross-product of the
    /// concrete dimensions and `__ALL__`.
    pub fn request_timing(&self, namespace: &str, cache_name: &str, status: u16, elapsed_ms: u64) {
        let status = status.to_string();
        for namespace_dim in [namespace, "__ALL__"] {
            for cache_name_dim in [cache_name, "__ALL__"] {
                self.relay.timing(
                    "spectre.request_timing",
                    elapsed_ms,
                    &[
                        ("status", status.as_str()),
                        ("namespace", namespace_dim),
                        ("cache_name", cache_name_dim),
                    ],
                );
            }
        }
        self.requests_total
            .with_label_values(&[namespace, status.as_str()])
            .inc();
        self.request_duration_ms
            .with_label_values(&[namespace, cache_name])
            .observe(elapsed_ms as f64);
    }

    /// Renders the Prometheus text exposition for `GET /metrics`.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode prometheus metrics: {e}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_rendering() {
        let metrics = ProxyMetrics::noop();
        metrics.fetch("backend.main", "timestamp", "miss");
        metrics.fetch("backend.main", "timestamp", "hit");
        metrics.store("backend.main", "timestamp");
        metrics.request_timing("backend.main", "timestamp", 200, 12);

        let text = metrics.render();
        assert!(text.contains("casper_cache_lookups_total"));
        assert!(text.contains("cache_status=\"hit\""));
        assert!(text.contains("casper_cache_stores_total"));
        assert!(text.contains("casper_requests_total"));
        assert!(text.contains("casper_request_duration_ms"));
    }

    #[test]
    fn test_relay_timing_cross_product() {
        // Counts 4 datagrams per request via a live receiver
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();

        let relay = Metrics::new_relay("127.0.0.1", port, vec![]).unwrap();
        let metrics = ProxyMetrics::new(relay);
        metrics.request_timing("backend.main", "timestamp", 200, 5);

        let mut lines = Vec::new();
        let mut buf = [0u8; 2048];
        while let Ok((n, _)) = receiver.recv_from(&mut buf) {
            lines.push(String::from_utf8_lossy(&buf[..n]).to_string());
            if lines.len() == 4 {
                break;
            }
        }
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.ends_with(":5|ms")));
        assert!(lines.iter().any(|l| l.contains(r#"["namespace","__ALL__"]"#)));
        assert!(lines
            .iter()
            .any(|l| l.contains(r#"["cache_name","__ALL__"]"#)));
    }
}
