use shared::metrics_defs::{MetricDef, MetricType};

pub const FETCH_BODY_AND_HEADERS: MetricDef = MetricDef {
    name: "spectre.fetch_body_and_headers",
    metric_type: MetricType::Counter,
    description: "Cache lookups. Tagged with namespace, cache_name, cache_status.",
};

pub const HIT_RATE: MetricDef = MetricDef {
    name: "spectre.hit_rate",
    metric_type: MetricType::Counter,
    description: "Lookup outcomes for hit-rate dashboards. Same tags as fetch.",
};

pub const STORE_BODY_AND_HEADERS: MetricDef = MetricDef {
    name: "spectre.store_body_and_headers",
    metric_type: MetricType::Counter,
    description: "Responses written to storage. Tagged with namespace, cache_name.",
};

pub const BULK_HIT_RATE: MetricDef = MetricDef {
    name: "spectre.bulk_hit_rate",
    metric_type: MetricType::Counter,
    description: "Whole-request outcome of bulk endpoints.",
};

pub const NO_CACHE_HEADER: MetricDef = MetricDef {
    name: "spectre.no_cache_header",
    metric_type: MetricType::Counter,
    description: "Requests that bypassed the cache via a no-cache header.",
};

pub const REQUEST_TIMING: MetricDef = MetricDef {
    name: "spectre.request_timing",
    metric_type: MetricType::Histogram,
    description: "Per-request wall time in ms, over {namespace,__ALL__} x {cache_name,__ALL__}.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    FETCH_BODY_AND_HEADERS,
    HIT_RATE,
    STORE_BODY_AND_HEADERS,
    BULK_HIT_RATE,
    NO_CACHE_HEADER,
    REQUEST_TIMING,
];
