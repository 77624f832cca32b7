//! Metrics capability injected into the server.
//!
//! The server records through the [`ServerMetrics`] trait rather than
//! process-wide statics, so tests run with [`NullMetrics`] and the
//! binary wires up [`PromMetrics`] backed by a `prometheus-client`
//! registry served over HTTP (see [`crate::metrics_service`]).

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Hooks the server calls while handling requests and expiring
/// records. Implementations must be thread-safe; calls are made
/// concurrently without extra synchronisation.
pub trait ServerMetrics: Send + Sync {
    fn add_active_registration(&self, topic: &str);
    fn remove_active_registration(&self, topic: &str);
    fn observe_discovery_size(&self, topic: &str, size: usize);
    fn observe_discovery_duration(&self, topic: &str, seconds: f64);
    fn count_error(&self, operation: &str);
}

/// Discards everything. The default for tests and embedded use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl ServerMetrics for NullMetrics {
    fn add_active_registration(&self, _topic: &str) {}
    fn remove_active_registration(&self, _topic: &str) {}
    fn observe_discovery_size(&self, _topic: &str, _size: usize) {}
    fn observe_discovery_duration(&self, _topic: &str, _seconds: f64) {}
    fn count_error(&self, _operation: &str) {}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TopicLabels {
    topic: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    operation: String,
}

/// Forwards to `prometheus-client` metric families under the
/// `rendezvous` prefix.
#[derive(Debug, Clone)]
pub struct PromMetrics {
    active_registrations: Family<TopicLabels, Gauge>,
    discovery_size: Family<TopicLabels, Histogram>,
    discovery_duration: Family<TopicLabels, Histogram>,
    discovery_errors: Family<OperationLabels, Counter>,
}

impl PromMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("rendezvous");

        let active_registrations = Family::<TopicLabels, Gauge>::default();
        sub_registry.register(
            "active_registrations",
            "Number of active unique registrations",
            active_registrations.clone(),
        );

        let discovery_size = Family::<TopicLabels, Histogram>::new_with_constructor(|| {
            Histogram::new((0..=10).map(f64::from))
        });
        sub_registry.register(
            "discovery_size",
            "Number of records found for each discover request",
            discovery_size.clone(),
        );

        let discovery_duration = Family::<TopicLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0].into_iter())
        });
        sub_registry.register(
            "discovery_duration",
            "Discovery request duration in seconds",
            discovery_duration.clone(),
        );

        let discovery_errors = Family::<OperationLabels, Counter>::default();
        sub_registry.register(
            "discovery_errors",
            "Number of errors labelled by the type of operation",
            discovery_errors.clone(),
        );

        Self {
            active_registrations,
            discovery_size,
            discovery_duration,
            discovery_errors,
        }
    }

    fn topic_labels(topic: &str) -> TopicLabels {
        TopicLabels {
            topic: topic.to_owned(),
        }
    }
}

impl ServerMetrics for PromMetrics {
    fn add_active_registration(&self, topic: &str) {
        self.active_registrations
            .get_or_create(&Self::topic_labels(topic))
            .inc();
    }

    fn remove_active_registration(&self, topic: &str) {
        self.active_registrations
            .get_or_create(&Self::topic_labels(topic))
            .dec();
    }

    fn observe_discovery_size(&self, topic: &str, size: usize) {
        self.discovery_size
            .get_or_create(&Self::topic_labels(topic))
            .observe(size as f64);
    }

    fn observe_discovery_duration(&self, topic: &str, seconds: f64) {
        self.discovery_duration
            .get_or_create(&Self::topic_labels(topic))
            .observe(seconds);
    }

    fn count_error(&self, operation: &str) {
        self.discovery_errors
            .get_or_create(&OperationLabels {
                operation: operation.to_owned(),
            })
            .inc();
    }
}
