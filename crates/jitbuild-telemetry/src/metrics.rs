//! Prometheus metrics registry.
//!
//! Cache, build and request metrics for the compile-on-demand server.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Duration histogram buckets (in seconds).
/// Covers 1ms to 10s, compiles rarely finish faster.
const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Size histogram buckets (in bytes).
/// Covers 100B to 10MB range with exponential growth.
const SIZE_BUCKETS: [f64; 6] = [100.0, 1000.0, 10000.0, 100000.0, 1000000.0, 10000000.0];

/// Request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: u16,
}

/// Cache lookup labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub format: String,
    pub outcome: String,
}

/// Build labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildLabels {
    pub format: String,
    pub outcome: String,
}

/// Per-format labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FormatLabels {
    pub format: String,
}

/// Session error labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
}

/// Metrics registry holding all jitbuild metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Request metrics
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<RequestLabels, Histogram>,

    // Session metrics
    pub active_sessions: Gauge,
    pub cache_lookups_total: Family<CacheLabels, Counter>,
    pub passthrough_total: Counter,
    pub session_errors_total: Family<ErrorLabels, Counter>,

    // Build metrics
    pub builds_total: Family<BuildLabels, Counter>,
    pub build_duration_seconds: Family<FormatLabels, Histogram>,
    pub artifact_size_bytes: Family<FormatLabels, Histogram>,
    pub coalesced_builds_total: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // Request metrics
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "jitbuild_requests_total",
            "Total number of HTTP requests handled",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().cloned())
            });
        registry.register(
            "jitbuild_request_duration_seconds",
            "HTTP request duration in seconds",
            request_duration_seconds.clone(),
        );

        // Session metrics
        let active_sessions = Gauge::default();
        registry.register(
            "jitbuild_active_sessions",
            "Number of build sessions in progress",
            active_sessions.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "jitbuild_cache_lookups_total",
            "Freshness decisions by format and outcome",
            cache_lookups_total.clone(),
        );

        let passthrough_total = Counter::default();
        registry.register(
            "jitbuild_passthrough_total",
            "Sources served raw without compilation",
            passthrough_total.clone(),
        );

        let session_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "jitbuild_session_errors_total",
            "Sessions that ended in an error, by kind",
            session_errors_total.clone(),
        );

        // Build metrics
        let builds_total = Family::<BuildLabels, Counter>::default();
        registry.register(
            "jitbuild_builds_total",
            "Compiles by format and outcome",
            builds_total.clone(),
        );

        let build_duration_seconds =
            Family::<FormatLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().cloned())
            });
        registry.register(
            "jitbuild_build_duration_seconds",
            "Compile duration in seconds",
            build_duration_seconds.clone(),
        );

        let artifact_size_bytes =
            Family::<FormatLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(SIZE_BUCKETS.iter().cloned())
            });
        registry.register(
            "jitbuild_artifact_size_bytes",
            "Size of published artifacts in bytes",
            artifact_size_bytes.clone(),
        );

        let coalesced_builds_total = Counter::default();
        registry.register(
            "jitbuild_coalesced_builds_total",
            "Sessions that joined a compile already in flight",
            coalesced_builds_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            active_sessions,
            cache_lookups_total,
            passthrough_total,
            session_errors_total,
            builds_total,
            build_duration_seconds,
            artifact_size_bytes,
            coalesced_builds_total,
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, method: &str, status: u16, duration_secs: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            status,
        };

        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a freshness decision.
    pub fn record_cache_lookup(&self, format: &str, hit: bool) {
        let labels = CacheLabels {
            format: format.to_string(),
            outcome: if hit { "hit" } else { "miss" }.to_string(),
        };
        self.cache_lookups_total.get_or_create(&labels).inc();
    }

    /// Record a finished compile.
    pub fn record_build(&self, format: &str, success: bool, duration_secs: f64, size: u64) {
        let labels = BuildLabels {
            format: format.to_string(),
            outcome: if success { "success" } else { "error" }.to_string(),
        };
        self.builds_total.get_or_create(&labels).inc();

        if success {
            let format = FormatLabels {
                format: format.to_string(),
            };
            self.build_duration_seconds
                .get_or_create(&format)
                .observe(duration_secs);
            self.artifact_size_bytes
                .get_or_create(&format)
                .observe(size as f64);
        }
    }

    /// Record a raw passthrough.
    pub fn record_passthrough(&self) {
        self.passthrough_total.inc();
    }

    /// Record a session error.
    pub fn record_session_error(&self, kind: &str) {
        let labels = ErrorLabels {
            kind: kind.to_string(),
        };
        self.session_errors_total.get_or_create(&labels).inc();
    }

    /// Record a session that awaited another session's compile.
    pub fn record_coalesced(&self) {
        self.coalesced_builds_total.inc();
    }

    pub fn session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn session_finished(&self) {
        self.active_sessions.dec();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
