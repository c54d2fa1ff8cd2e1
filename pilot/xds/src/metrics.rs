use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Discovery response cache and translation metrics.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryMetrics {
    hits: Family<EndpointLabels, Counter>,
    misses: Family<EndpointLabels, Counter>,
    errors: Family<EndpointLabels, Counter>,
    clears: Counter,
    entries: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EndpointLabels {
    endpoint: &'static str,
}

// === impl DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let hits = Family::<EndpointLabels, Counter>::default();
        reg.register(
            "cache_hits",
            "Total number of discovery responses served from the cache",
            hits.clone(),
        );

        let misses = Family::<EndpointLabels, Counter>::default();
        reg.register(
            "cache_misses",
            "Total number of discovery responses computed",
            misses.clone(),
        );

        let errors = Family::<EndpointLabels, Counter>::default();
        reg.register(
            "translation_errors",
            "Total number of discovery requests that failed to translate",
            errors.clone(),
        );

        let clears = Counter::default();
        reg.register(
            "cache_clears",
            "Total number of times the discovery cache was invalidated",
            clears.clone(),
        );

        let entries = Gauge::default();
        reg.register(
            "cache_entries",
            "Number of discovery responses in the cache",
            entries.clone(),
        );

        Self {
            hits,
            misses,
            errors,
            clears,
            entries,
        }
    }

    pub(crate) fn hit(&self, endpoint: &'static str) {
        self.hits.get_or_create(&EndpointLabels { endpoint }).inc();
    }

    pub(crate) fn miss(&self, endpoint: &'static str) {
        self.misses.get_or_create(&EndpointLabels { endpoint }).inc();
    }

    pub(crate) fn error(&self, endpoint: &'static str) {
        self.errors.get_or_create(&EndpointLabels { endpoint }).inc();
    }

    pub(crate) fn cleared(&self) {
        self.clears.inc();
        self.entries.set(0);
    }

    pub(crate) fn set_entries(&self, n: usize) {
        self.entries.set(n as i64);
    }
}
