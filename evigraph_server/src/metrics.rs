//! Prometheus instrumentation, exposed at `GET /metrics` in the text
//! exposition format.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Label set for per-endpoint counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

/// Server-level metrics.
pub struct PrometheusMetrics {
    registry: Registry,
    pub http_requests_total: Family<EndpointLabels, Counter>,
    pub ingest_jobs_total: Counter,
    pub queries_total: Counter,
    pub feedback_total: Counter,
    pub graph_nodes: Gauge,
    pub graph_edges: Gauge,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let http_requests_total = Family::<EndpointLabels, Counter>::default();
        let ingest_jobs_total = Counter::default();
        let queries_total = Counter::default();
        let feedback_total = Counter::default();
        let graph_nodes = Gauge::default();
        let graph_edges = Gauge::default();

        registry.register(
            "evigraph_http_requests",
            "HTTP requests processed",
            http_requests_total.clone(),
        );
        registry.register(
            "evigraph_ingest_jobs",
            "Ingest jobs accepted",
            ingest_jobs_total.clone(),
        );
        registry.register(
            "evigraph_queries",
            "Query requests served",
            queries_total.clone(),
        );
        registry.register(
            "evigraph_feedback",
            "Feedback requests accepted",
            feedback_total.clone(),
        );
        registry.register("evigraph_graph_nodes", "Nodes in the graph", graph_nodes.clone());
        registry.register("evigraph_graph_edges", "Edges in the graph", graph_edges.clone());

        Self {
            registry,
            http_requests_total,
            ingest_jobs_total,
            queries_total,
            feedback_total,
            graph_nodes,
            graph_edges,
        }
    }

    pub fn track(&self, endpoint: &str) {
        self.http_requests_total
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        encode(&mut out, &self.registry).unwrap_or_default();
        out
    }
}
